use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backend::sim::{SimBackend, SimConfig, SimFault};
use crate::error::MissionError;
use crate::mission::{FailureMode, FailureSpec, Mission, MissionSpeeds, Waypoint, WaypointFrame};
use crate::models::{AgentRole, Position3D as ModelPosition3D};
use crate::registry::AgentRegistry;

/// シナリオメタデータ
#[derive(Debug, Deserialize, Serialize)]
pub struct ScenarioMeta {
    pub version: String,
    pub name: String,
    pub description: String,
}

/// バックエンドの種類
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sim,
}

/// バックエンド設定
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    #[serde(default = "default_tick")]
    pub tick_s: f64,
    #[serde(default = "default_takeoff_altitude")]
    pub takeoff_altitude_m: f64,
    #[serde(default = "default_true")]
    pub reachable: bool,
    #[serde(default)]
    pub faults: Vec<SimFault>,
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_tick() -> f64 {
    0.1
}

fn default_takeoff_altitude() -> f64 {
    3.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Position3D {
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
}

impl From<&Position3D> for ModelPosition3D {
    fn from(p: &Position3D) -> Self {
        ModelPosition3D::new(p.x_m, p.y_m, p.z_m)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpawnPose {
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
    #[serde(default)]
    pub yaw_deg: f64,
}

/// 機体設定
#[derive(Debug, Deserialize, Serialize)]
pub struct VehicleConfig {
    pub name: String,
    #[serde(default = "default_vehicle_type")]
    pub vehicle_type: String,
    pub spawn: SpawnPose,
}

fn default_vehicle_type() -> String {
    "SimpleFlight".to_string()
}

/// 編隊設定
#[derive(Debug, Deserialize, Serialize)]
pub struct FleetConfig {
    pub leader: String,
    #[serde(default)]
    pub adversary: Option<String>,
    pub vehicles: Vec<VehicleConfig>,
}

/// フェーズ別速度
#[derive(Debug, Deserialize, Serialize)]
pub struct SpeedsConfig {
    pub takeoff_mps: f64,
    pub alignment_mps: f64,
    pub cruise_mps: f64,
    pub crash_mps: f64,
    pub landing_mps: f64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WaypointConfig {
    pub x_m: f64,
    pub y_m: f64,
    /// 省略時は巡航高度
    #[serde(default)]
    pub z_m: Option<f64>,
    #[serde(default)]
    pub speed_mps: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameConfig {
    #[default]
    Local,
    World,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureModeConfig {
    #[default]
    Crash,
    Ram,
}

/// 範囲外トリガーの扱い
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTriggerPolicy {
    #[default]
    Reject,
    Ignore,
}

/// 故障トリガー設定
#[derive(Debug, Deserialize, Serialize)]
pub struct FailureConfig {
    pub waypoint_index: usize,
    pub progress: f64,
    #[serde(default)]
    pub mode: FailureModeConfig,
    #[serde(default)]
    pub on_invalid: InvalidTriggerPolicy,
}

/// ミッション設定
#[derive(Debug, Deserialize, Serialize)]
pub struct MissionConfig {
    pub cruise_altitude_m: f64,
    #[serde(default)]
    pub ground_altitude_m: f64,
    pub speeds: SpeedsConfig,
    #[serde(default)]
    pub command_timeout_s: Option<f64>,
    #[serde(default)]
    pub waypoint_frame: FrameConfig,
    pub waypoints: Vec<WaypointConfig>,
    #[serde(default)]
    pub failure: Option<FailureConfig>,
    #[serde(default)]
    pub adversary_station: Option<Position3D>,
}

/// 完全なシナリオ設定
#[derive(Debug, Deserialize)]
pub struct ScenarioConfig {
    pub meta: ScenarioMeta,
    pub backend: BackendConfig,
    pub fleet: FleetConfig,
    pub mission: MissionConfig,
}

impl ScenarioConfig {
    /// YAMLファイルからシナリオ設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| ScenarioError::IoError(path.to_path_buf(), e))?;

        let config: ScenarioConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ScenarioError::ParseError(path.to_path_buf(), e))?;

        config.validate()?;

        Ok(config)
    }

    /// YAML文字列から読み込み
    pub fn from_yaml(contents: &str) -> Result<Self, ScenarioError> {
        let config: ScenarioConfig = serde_yaml::from_str(contents)
            .map_err(|e| ScenarioError::ParseError(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定の基本的な検証
    pub fn validate(&self) -> Result<(), ScenarioError> {
        let invalid = |msg: String| Err(ScenarioError::ValidationError(msg));

        let tick = self.backend.tick_s;
        let scale = self.backend.time_scale;
        if !(tick.is_finite() && tick > 0.0) {
            return invalid(format!("tick_s must be positive and finite, got {}", tick));
        }
        if !(scale.is_finite() && scale >= 0.0) {
            return invalid(format!("time_scale must be non-negative and finite, got {}", scale));
        }
        if Duration::try_from_secs_f64(tick * scale).is_err() {
            return invalid(format!("tick_s * time_scale is out of range ({} * {})", tick, scale));
        }

        if self.fleet.vehicles.is_empty() {
            return invalid("fleet has no vehicles".to_string());
        }
        if !self.has_vehicle(&self.fleet.leader) {
            return invalid(format!("leader {} is not in the fleet", self.fleet.leader));
        }
        if let Some(adversary) = &self.fleet.adversary {
            if !self.has_vehicle(adversary) {
                return invalid(format!("adversary {} is not in the fleet", adversary));
            }
            if *adversary == self.fleet.leader {
                return invalid("leader and adversary must differ".to_string());
            }
        }

        if let Some(timeout) = self.mission.command_timeout_s {
            if timeout <= 0.0 || Duration::try_from_secs_f64(timeout).is_err() {
                return invalid(format!("command_timeout_s is out of range, got {}", timeout));
            }
        }

        for fault in &self.backend.faults {
            let agent = fault.agent();
            if !self.has_vehicle(agent) {
                return invalid(format!("fault targets unknown vehicle {}", agent));
            }
        }

        // 残りの整合性（速度・高度・トリガー）はミッション構築時に検証
        self.build_registry()?;
        self.build_mission()?;

        Ok(())
    }

    fn has_vehicle(&self, name: &str) -> bool {
        self.fleet.vehicles.iter().any(|v| v.name == name)
    }

    /// 機体レジストリを構築（設定順に登録）
    pub fn build_registry(&self) -> Result<AgentRegistry, ScenarioError> {
        let mut registry = AgentRegistry::new();
        for vehicle in &self.fleet.vehicles {
            let role = if vehicle.name == self.fleet.leader {
                AgentRole::Leader
            } else if self.fleet.adversary.as_deref() == Some(vehicle.name.as_str()) {
                AgentRole::Adversary
            } else {
                AgentRole::Follower
            };
            let spawn = ModelPosition3D::new(vehicle.spawn.x_m, vehicle.spawn.y_m, vehicle.spawn.z_m);
            registry.register_at(&vehicle.name, role, spawn)?;
        }
        Ok(registry)
    }

    /// ミッションを構築
    pub fn build_mission(&self) -> Result<Mission, ScenarioError> {
        let cfg = &self.mission;
        let waypoints = cfg
            .waypoints
            .iter()
            .map(|wp| Waypoint {
                position: ModelPosition3D::new(wp.x_m, wp.y_m, wp.z_m.unwrap_or(cfg.cruise_altitude_m)),
                speed: wp.speed_mps,
            })
            .collect();

        let (failure, policy) = match &cfg.failure {
            Some(f) => {
                let mode = match f.mode {
                    FailureModeConfig::Crash => FailureMode::Crash,
                    FailureModeConfig::Ram => FailureMode::Ram,
                };
                let spec = FailureSpec {
                    waypoint_index: f.waypoint_index,
                    progress: f.progress,
                    mode,
                };
                (Some(spec), f.on_invalid)
            }
            None => (None, InvalidTriggerPolicy::Reject),
        };

        let mission = match policy {
            InvalidTriggerPolicy::Reject => Mission::new(waypoints, failure)?,
            InvalidTriggerPolicy::Ignore => Mission::permissive(waypoints, failure)?,
        };

        let frame = match cfg.waypoint_frame {
            FrameConfig::Local => WaypointFrame::Local,
            FrameConfig::World => WaypointFrame::World,
        };

        let mission = mission
            .with_speeds(MissionSpeeds {
                takeoff: cfg.speeds.takeoff_mps,
                alignment: cfg.speeds.alignment_mps,
                cruise: cfg.speeds.cruise_mps,
                crash: cfg.speeds.crash_mps,
                landing: cfg.speeds.landing_mps,
            })?
            .with_altitudes(cfg.cruise_altitude_m, cfg.ground_altitude_m)?
            .with_frame(frame)
            .with_adversary_station(cfg.adversary_station.as_ref().map(ModelPosition3D::from));

        if mission.failure.is_some_and(|f| f.mode == FailureMode::Ram) && self.fleet.adversary.is_none() {
            return Err(ScenarioError::ValidationError(
                "ram failure requires fleet.adversary".to_string(),
            ));
        }

        Ok(mission)
    }

    /// シミュレーションバックエンドを構築
    ///
    /// 離陸・着陸速度は検証済みのミッションから取ります。
    pub fn build_backend(&self, mission: &Mission) -> SimBackend {
        let config = SimConfig {
            time_scale: self.backend.time_scale,
            tick_s: self.backend.tick_s,
            takeoff_altitude_m: self.backend.takeoff_altitude_m,
            takeoff_speed_mps: mission.speeds.takeoff,
            landing_speed_mps: mission.speeds.landing,
            reachable: self.backend.reachable,
        };
        let backend = SimBackend::new(config);
        for vehicle in &self.fleet.vehicles {
            backend.add_vehicle(&vehicle.name);
        }
        for fault in &self.backend.faults {
            backend.add_fault(fault.clone());
        }
        backend
    }

    /// 範囲外の値は `validate` で弾かれるため、ここでは変換できたものだけを返す
    pub fn command_timeout(&self) -> Option<Duration> {
        self.mission
            .command_timeout_s
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    /// シナリオの概要を表示
    pub fn print_summary(&self) {
        println!("=== シナリオ情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!("バージョン: {}", self.meta.version);
        println!();

        println!("=== バックエンド設定 ===");
        println!("種類: {:?}", self.backend.kind);
        println!("時間刻み: {:.3}秒 (倍率 {:.2})", self.backend.tick_s, self.backend.time_scale);
        println!("故障設定: {}件", self.backend.faults.len());
        println!();

        println!("=== 編隊 ===");
        println!("機体数: {}機", self.fleet.vehicles.len());
        println!("リーダー: {}", self.fleet.leader);
        if let Some(adversary) = &self.fleet.adversary {
            println!("標的機: {}", adversary);
        }
        for v in &self.fleet.vehicles {
            println!(
                "  {} ({}): スポーン ({:.1}, {:.1}, {:.1}) 方位 {:.0}°",
                v.name, v.vehicle_type, v.spawn.x_m, v.spawn.y_m, v.spawn.z_m, v.spawn.yaw_deg
            );
        }
        println!();

        println!("=== ミッション ===");
        println!("巡航高度: {:.1}m", self.mission.cruise_altitude_m);
        println!("巡航速度: {:.1}m/s", self.mission.speeds.cruise_mps);
        println!("ウェイポイント: {}箇所", self.mission.waypoints.len());
        match &self.mission.failure {
            Some(f) => println!(
                "故障トリガー: ウェイポイント {} の {:.0}% 地点 ({:?})",
                f.waypoint_index,
                f.progress * 100.0,
                f.mode
            ),
            None => println!("故障トリガー: なし"),
        }
    }
}

/// シナリオ読み込みエラー
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("シナリオファイルが見つかりません: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("ファイル読み込みエラー {path}: {err}", path = .0.display(), err = .1)]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("YAML解析エラー {path}: {err}", path = .0.display(), err = .1)]
    ParseError(PathBuf, #[source] serde_yaml::Error),

    #[error("設定検証エラー: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Mission(#[from] MissionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
meta:
  version: "1.0"
  name: test
  description: five drones, leader fails on the second leg
backend:
  kind: sim
  time_scale: 0.0
fleet:
  leader: Drone3
  vehicles:
    - { name: Drone1, spawn: { x_m: 0, y_m: 0, z_m: 0 } }
    - { name: Drone2, spawn: { x_m: 4, y_m: 0, z_m: 0 } }
    - { name: Drone3, spawn: { x_m: 8, y_m: 0, z_m: 0 } }
mission:
  cruise_altitude_m: 20
  speeds: { takeoff_mps: 3, alignment_mps: 5, cruise_mps: 5, crash_mps: 10, landing_mps: 2 }
  command_timeout_s: 30
  waypoints:
    - { x_m: 10, y_m: 0 }
    - { x_m: 10, y_m: 10, z_m: 25 }
  failure: { waypoint_index: 1, progress: 0.3 }
"#;

    #[test]
    fn test_parse_and_build() {
        let scenario = ScenarioConfig::from_yaml(SCENARIO).unwrap();
        let registry = scenario.build_registry().unwrap();
        assert_eq!(registry.leader().map(|a| a.name.as_str()), Some("Drone3"));
        assert_eq!(registry.get("Drone2").unwrap().spawn, ModelPosition3D::new(4.0, 0.0, 0.0));

        let mission = scenario.build_mission().unwrap();
        assert_eq!(mission.waypoints[0].position.z, 20.0);
        assert_eq!(mission.waypoints[1].position.z, 25.0);
        assert_eq!(mission.failure, Some(FailureSpec::new(1, 0.3)));
        assert_eq!(scenario.command_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_out_of_range_trigger_rejected_by_default() {
        let yaml = SCENARIO.replace("waypoint_index: 1", "waypoint_index: 2");
        let result = ScenarioConfig::from_yaml(&yaml);
        assert!(matches!(
            result,
            Err(ScenarioError::Mission(MissionError::ConfigInconsistent(_)))
        ));
    }

    #[test]
    fn test_out_of_range_trigger_ignored_on_request() {
        let yaml = SCENARIO.replace(
            "waypoint_index: 1, progress: 0.3",
            "waypoint_index: 9, progress: 0.3, on_invalid: ignore",
        );
        let scenario = ScenarioConfig::from_yaml(&yaml).unwrap();
        assert!(scenario.build_mission().unwrap().failure.is_none());
    }

    #[test]
    fn test_unknown_leader_rejected() {
        let yaml = SCENARIO.replace("leader: Drone3", "leader: Drone9");
        assert!(matches!(
            ScenarioConfig::from_yaml(&yaml),
            Err(ScenarioError::ValidationError(_))
        ));
    }

    #[test]
    fn test_duplicate_vehicle_rejected() {
        let yaml = SCENARIO.replace("name: Drone2", "name: Drone1");
        assert!(matches!(
            ScenarioConfig::from_yaml(&yaml),
            Err(ScenarioError::Mission(MissionError::DuplicateAgent(_)))
        ));
    }

    #[test]
    fn test_backend_uses_mission_speeds() {
        let scenario = ScenarioConfig::from_yaml(SCENARIO).unwrap();
        let mission = scenario.build_mission().unwrap();
        let backend = scenario.build_backend(&mission);
        assert_eq!(backend.config().takeoff_speed_mps, mission.speeds.takeoff);
        assert_eq!(backend.config().landing_speed_mps, 2.0);
    }

    #[test]
    fn test_huge_command_timeout_rejected() {
        let yaml = SCENARIO.replace("command_timeout_s: 30", "command_timeout_s: 1.0e300");
        assert!(matches!(
            ScenarioConfig::from_yaml(&yaml),
            Err(ScenarioError::ValidationError(_))
        ));
    }

    #[test]
    fn test_non_finite_timing_rejected() {
        for backend in [
            "time_scale: .nan",
            "time_scale: .inf",
            "time_scale: 1.0\n  tick_s: .inf",
            "time_scale: 1.0e300\n  tick_s: 1.0e300",
        ] {
            let yaml = SCENARIO.replace("time_scale: 0.0", backend);
            assert!(
                matches!(
                    ScenarioConfig::from_yaml(&yaml),
                    Err(ScenarioError::ValidationError(_))
                ),
                "{} should be rejected",
                backend
            );
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ScenarioConfig::from_file("scenarios/does_not_exist.yaml"),
            Err(ScenarioError::FileNotFound(_))
        ));
    }
}
