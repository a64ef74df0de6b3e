//! # Mission モジュール
//!
//! ウェイポイント列・フェーズ別速度・故障トリガーを保持します。
//! 故障トリガーは構築時に検証されます。

use tracing::warn;

use crate::error::MissionError;
use crate::models::Position3D;

/// ウェイポイント
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub position: Position3D,
    /// 区間速度（None ならミッションの巡航速度）
    pub speed: Option<f64>,
}

impl Waypoint {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: Position3D::new(x, y, z),
            speed: None,
        }
    }
}

/// フェーズ別の速度（m/s）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissionSpeeds {
    pub takeoff: f64,
    pub alignment: f64,
    pub cruise: f64,
    pub crash: f64,
    pub landing: f64,
}

impl Default for MissionSpeeds {
    fn default() -> Self {
        Self {
            takeoff: 3.0,
            alignment: 5.0,
            cruise: 5.0,
            crash: 10.0,
            landing: 2.0,
        }
    }
}

impl MissionSpeeds {
    fn validate(&self) -> Result<(), MissionError> {
        let all = [
            ("takeoff", self.takeoff),
            ("alignment", self.alignment),
            ("cruise", self.cruise),
            ("crash", self.crash),
            ("landing", self.landing),
        ];
        for (phase, speed) in all {
            if !(speed.is_finite() && speed > 0.0) {
                return Err(MissionError::ConfigInconsistent(format!(
                    "{} speed must be positive, got {}",
                    phase, speed
                )));
            }
        }
        Ok(())
    }
}

/// ウェイポイントの座標系
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaypointFrame {
    /// 全機が同じローカル座標を目指す
    #[default]
    Local,
    /// ワールド座標。機体ごとにスポーン地点を差し引いて指令する
    World,
}

/// 故障の形態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// 真下の地表へ降下
    #[default]
    Crash,
    /// 標的機に体当たり
    Ram,
}

/// リーダー故障のトリガー
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureSpec {
    /// 故障が発生するウェイポイント番号
    pub waypoint_index: usize,
    /// そのウェイポイントへの進捗率（0〜1）
    pub progress: f64,
    pub mode: FailureMode,
}

impl FailureSpec {
    pub fn new(waypoint_index: usize, progress: f64) -> Self {
        Self {
            waypoint_index,
            progress,
            mode: FailureMode::Crash,
        }
    }

    pub fn validate(&self, waypoint_count: usize) -> Result<(), MissionError> {
        if self.waypoint_index >= waypoint_count {
            return Err(MissionError::ConfigInconsistent(format!(
                "failure waypoint index {} out of range (waypoints: {})",
                self.waypoint_index, waypoint_count
            )));
        }
        if !(0.0..=1.0).contains(&self.progress) {
            return Err(MissionError::ConfigInconsistent(format!(
                "failure progress {} outside [0, 1]",
                self.progress
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Mission {
    pub waypoints: Vec<Waypoint>,
    pub failure: Option<FailureSpec>,
    pub speeds: MissionSpeeds,
    /// 水平移動前に揃える共通高度（m）
    pub cruise_altitude: f64,
    /// 墜落先の地表高度（m）
    pub ground_altitude: f64,
    pub frame: WaypointFrame,
    /// 標的機の待機位置（ローカル座標）
    pub adversary_station: Option<Position3D>,
}

impl Mission {
    /// ミッションを構築。故障トリガーが範囲外なら `ConfigInconsistent`。
    pub fn new(waypoints: Vec<Waypoint>, failure: Option<FailureSpec>) -> Result<Self, MissionError> {
        if let Some(spec) = &failure {
            spec.validate(waypoints.len())?;
        }
        Self::check_waypoints(&waypoints)?;
        Ok(Self::build(waypoints, failure))
    }

    /// 範囲外の故障トリガーを警告付きで無効化して構築
    pub fn permissive(waypoints: Vec<Waypoint>, failure: Option<FailureSpec>) -> Result<Self, MissionError> {
        Self::check_waypoints(&waypoints)?;
        let failure = failure.and_then(|spec| match spec.validate(waypoints.len()) {
            Ok(()) => Some(spec),
            Err(e) => {
                warn!(error = %e, "故障トリガーを無効化します");
                None
            }
        });
        Ok(Self::build(waypoints, failure))
    }

    fn build(waypoints: Vec<Waypoint>, failure: Option<FailureSpec>) -> Self {
        Self {
            waypoints,
            failure,
            speeds: MissionSpeeds::default(),
            cruise_altitude: 20.0,
            ground_altitude: 0.0,
            frame: WaypointFrame::Local,
            adversary_station: None,
        }
    }

    fn check_waypoints(waypoints: &[Waypoint]) -> Result<(), MissionError> {
        for (i, wp) in waypoints.iter().enumerate() {
            if !wp.position.is_finite() {
                return Err(MissionError::ConfigInconsistent(format!(
                    "waypoint {} has a non-finite coordinate",
                    i
                )));
            }
            if let Some(speed) = wp.speed {
                if !(speed.is_finite() && speed > 0.0) {
                    return Err(MissionError::ConfigInconsistent(format!(
                        "waypoint {} speed must be positive",
                        i
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn with_speeds(mut self, speeds: MissionSpeeds) -> Result<Self, MissionError> {
        speeds.validate()?;
        self.speeds = speeds;
        Ok(self)
    }

    pub fn with_altitudes(mut self, cruise: f64, ground: f64) -> Result<Self, MissionError> {
        if !(cruise.is_finite() && ground.is_finite()) || cruise <= ground {
            return Err(MissionError::ConfigInconsistent(format!(
                "cruise altitude {} must be above ground altitude {}",
                cruise, ground
            )));
        }
        self.cruise_altitude = cruise;
        self.ground_altitude = ground;
        Ok(self)
    }

    pub fn with_frame(mut self, frame: WaypointFrame) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_adversary_station(mut self, station: Option<Position3D>) -> Self {
        self.adversary_station = station;
        self
    }

    /// i 番目のウェイポイントが故障トリガーか
    pub fn is_trigger(&self, index: usize) -> bool {
        self.failure.is_some_and(|f| f.waypoint_index == index)
    }

    pub fn leg_speed(&self, index: usize) -> f64 {
        self.waypoints
            .get(index)
            .and_then(|wp| wp.speed)
            .unwrap_or(self.speeds.cruise)
    }
}
