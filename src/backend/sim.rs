//! # Sim バックエンド
//!
//! 外部飛行シミュレータの代わりに動作するプロセス内バックエンドです。
//! 各機体は指令速度で目標位置へ等速直線移動し、固定時間刻み（tick）で
//! 位置を更新します。デモやテスト用に故障（テレメトリ欠落・指令失敗・
//! 応答停止）をスクリプトで注入できます。
//!
//! 位置は機体ローカル座標系（スポーン地点が原点、z = 高度）で扱います。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::trace;

use crate::error::BackendError;
use crate::gateway::CommandKind;
use crate::models::{IFlightBackend, MotionHandle, Position3D};

/// シミュレーション設定
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// 実時間に対する倍率（0 なら待ち時間なしで即時に到達）
    pub time_scale: f64,
    /// 位置更新の時間刻み（秒）
    pub tick_s: f64,
    /// 離陸後の高度（m）
    pub takeoff_altitude_m: f64,
    pub takeoff_speed_mps: f64,
    pub landing_speed_mps: f64,
    /// false なら接続確認が失敗する
    pub reachable: bool,
}

impl SimConfig {
    /// 待ち時間なしの設定（テスト用）
    pub fn instant() -> Self {
        Self {
            time_scale: 0.0,
            ..Self::default()
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            tick_s: 0.1,
            takeoff_altitude_m: 3.0,
            takeoff_speed_mps: 2.0,
            landing_speed_mps: 2.0,
            reachable: true,
        }
    }
}

/// 注入する故障
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimFault {
    /// `start_query` 回目（1始まり）から `count` 回、位置取得が失敗する
    TelemetryDropout {
        agent: String,
        start_query: u32,
        count: u32,
    },
    /// `nth` 回目（1始まり、0 なら毎回）の指令が失敗する。
    /// 移動系は完了待ちで、制御系は発行時に失敗する。
    CommandFailure {
        agent: String,
        command: CommandKind,
        nth: u32,
    },
    /// `nth` 回目の移動系指令が完了しない
    CommandHang {
        agent: String,
        command: CommandKind,
        nth: u32,
    },
    /// 全ての呼び出しが発行時に失敗する
    Unresponsive { agent: String },
}

impl SimFault {
    pub fn agent(&self) -> &str {
        match self {
            SimFault::TelemetryDropout { agent, .. }
            | SimFault::CommandFailure { agent, .. }
            | SimFault::CommandHang { agent, .. }
            | SimFault::Unresponsive { agent } => agent,
        }
    }
}

fn occurrence_matches(nth: u32, count: u32) -> bool {
    nth == 0 || nth == count
}

/// 発行された指令の記録
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub agent: String,
    pub kind: CommandKind,
    pub target: Option<Position3D>,
}

#[derive(Debug, Default)]
struct Vehicle {
    position: Position3D,
    api_control: bool,
    armed: bool,
    queries: u32,
    issued: HashMap<CommandKind, u32>,
}

/// 故障判定の結果
enum Outcome {
    Proceed,
    FailOnJoin,
    Hang,
}

pub struct SimBackend {
    config: SimConfig,
    vehicles: Arc<Mutex<HashMap<String, Vehicle>>>,
    faults: Mutex<Vec<SimFault>>,
    log: Mutex<Vec<CommandRecord>>,
}

impl SimBackend {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            vehicles: Arc::new(Mutex::new(HashMap::new())),
            faults: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// 地上（ローカル原点）に機体を配置
    pub fn add_vehicle(&self, name: &str) {
        self.vehicles
            .lock()
            .insert(name.to_string(), Vehicle::default());
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn add_fault(&self, fault: SimFault) {
        self.faults.lock().push(fault);
    }

    /// 故障の影響を受けずに真の位置を返す
    pub fn position_of(&self, name: &str) -> Option<Position3D> {
        self.vehicles.lock().get(name).map(|v| v.position)
    }

    pub fn is_armed(&self, name: &str) -> bool {
        self.vehicles.lock().get(name).is_some_and(|v| v.armed)
    }

    /// 機体に発行された指令の種類（発行順）
    pub fn issued(&self, name: &str) -> Vec<CommandKind> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.agent == name)
            .map(|r| r.kind)
            .collect()
    }

    /// 機体に発行された移動指令の目標位置（発行順）
    pub fn move_targets(&self, name: &str) -> Vec<Position3D> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.agent == name && r.kind == CommandKind::MoveTo)
            .filter_map(|r| r.target)
            .collect()
    }

    pub fn records(&self) -> Vec<CommandRecord> {
        self.log.lock().clone()
    }

    /// 制御・アーム済みの状態で指定位置に置く
    pub fn force_airborne(&self, name: &str, position: Position3D) {
        if let Some(v) = self.vehicles.lock().get_mut(name) {
            v.position = position;
            v.api_control = true;
            v.armed = true;
        }
    }

    /// 指令を記録し、故障設定と照合する
    fn register_command(
        &self,
        agent: &str,
        kind: CommandKind,
        target: Option<Position3D>,
    ) -> Result<Outcome, BackendError> {
        let count = {
            let mut vehicles = self.vehicles.lock();
            let vehicle = vehicles
                .get_mut(agent)
                .ok_or_else(|| BackendError::UnknownVehicle(agent.to_string()))?;
            let count = vehicle.issued.entry(kind).or_insert(0);
            *count += 1;
            *count
        };

        self.log.lock().push(CommandRecord {
            agent: agent.to_string(),
            kind,
            target,
        });

        let faults = self.faults.lock();
        for fault in faults.iter().filter(|f| f.agent() == agent) {
            match fault {
                SimFault::Unresponsive { .. } => {
                    return Err(BackendError::Unreachable(format!("{} is not responding", agent)));
                }
                SimFault::CommandFailure { command, nth, .. }
                    if *command == kind && occurrence_matches(*nth, count) =>
                {
                    return match kind {
                        CommandKind::ApiControl | CommandKind::ArmDisarm => {
                            Err(BackendError::Rejected {
                                agent: agent.to_string(),
                                reason: format!("injected {:?} failure", kind),
                            })
                        }
                        _ => Ok(Outcome::FailOnJoin),
                    };
                }
                SimFault::CommandHang { command, nth, .. }
                    if *command == kind && occurrence_matches(*nth, count) =>
                {
                    return Ok(Outcome::Hang);
                }
                _ => {}
            }
        }
        Ok(Outcome::Proceed)
    }

    fn require_flight_ready(&self, agent: &str) -> Result<Position3D, BackendError> {
        let vehicles = self.vehicles.lock();
        let vehicle = vehicles
            .get(agent)
            .ok_or_else(|| BackendError::UnknownVehicle(agent.to_string()))?;
        if !vehicle.api_control || !vehicle.armed {
            return Err(BackendError::Rejected {
                agent: agent.to_string(),
                reason: "vehicle is not under API control and armed".to_string(),
            });
        }
        Ok(vehicle.position)
    }

    /// 目標への等速移動を行うハンドルを作成
    fn motion(&self, agent: &str, target: Position3D, speed: f64, outcome: Outcome) -> MotionHandle {
        match outcome {
            Outcome::Hang => return futures::future::pending().boxed(),
            Outcome::FailOnJoin => {
                let err = BackendError::Rejected {
                    agent: agent.to_string(),
                    reason: "injected motion failure".to_string(),
                };
                return futures::future::ready(Err(err)).boxed();
            }
            Outcome::Proceed => {}
        }

        let vehicles = Arc::clone(&self.vehicles);
        let agent = agent.to_string();
        let step = speed * self.config.tick_s;
        let pause = Duration::try_from_secs_f64(self.config.tick_s * self.config.time_scale)
            .unwrap_or_default();

        async move {
            loop {
                let arrived = {
                    let mut vehicles = vehicles.lock();
                    let vehicle = vehicles
                        .get_mut(&agent)
                        .ok_or_else(|| BackendError::UnknownVehicle(agent.clone()))?;
                    vehicle.position = vehicle.position.step_towards(&target, step);
                    vehicle.position == target
                };
                if arrived {
                    trace!(agent = %agent, %target, "到達");
                    return Ok(());
                }
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }
        .boxed()
    }

    fn check_speed(agent: &str, speed: f64) -> Result<(), BackendError> {
        if speed.is_finite() && speed > 0.0 {
            Ok(())
        } else {
            Err(BackendError::Rejected {
                agent: agent.to_string(),
                reason: format!("invalid speed {}", speed),
            })
        }
    }
}

#[async_trait]
impl IFlightBackend for SimBackend {
    async fn confirm_connection(&self) -> Result<(), BackendError> {
        if self.config.reachable {
            Ok(())
        } else {
            Err(BackendError::Unreachable("simulator refused connection".to_string()))
        }
    }

    async fn set_api_control(&self, agent: &str, enabled: bool) -> Result<(), BackendError> {
        self.register_command(agent, CommandKind::ApiControl, None)?;
        if let Some(v) = self.vehicles.lock().get_mut(agent) {
            v.api_control = enabled;
        }
        Ok(())
    }

    async fn arm_disarm(&self, agent: &str, armed: bool) -> Result<(), BackendError> {
        self.register_command(agent, CommandKind::ArmDisarm, None)?;
        let mut vehicles = self.vehicles.lock();
        let vehicle = vehicles
            .get_mut(agent)
            .ok_or_else(|| BackendError::UnknownVehicle(agent.to_string()))?;
        if armed && !vehicle.api_control {
            return Err(BackendError::Rejected {
                agent: agent.to_string(),
                reason: "API control is not enabled".to_string(),
            });
        }
        vehicle.armed = armed;
        Ok(())
    }

    async fn takeoff(&self, agent: &str) -> Result<MotionHandle, BackendError> {
        let outcome = self.register_command(agent, CommandKind::Takeoff, None)?;
        let position = self.require_flight_ready(agent)?;
        let target = position.with_altitude(position.z.max(self.config.takeoff_altitude_m));
        Ok(self.motion(agent, target, self.config.takeoff_speed_mps, outcome))
    }

    async fn move_to_position(
        &self,
        agent: &str,
        target: Position3D,
        speed: f64,
    ) -> Result<MotionHandle, BackendError> {
        let outcome = self.register_command(agent, CommandKind::MoveTo, Some(target))?;
        Self::check_speed(agent, speed)?;
        if !target.is_finite() {
            return Err(BackendError::Rejected {
                agent: agent.to_string(),
                reason: format!("invalid target {}", target),
            });
        }
        self.require_flight_ready(agent)?;
        Ok(self.motion(agent, target, speed, outcome))
    }

    async fn land(&self, agent: &str) -> Result<MotionHandle, BackendError> {
        let outcome = self.register_command(agent, CommandKind::Land, None)?;
        let position = self.require_flight_ready(agent)?;
        let target = position.with_altitude(0.0);
        Ok(self.motion(agent, target, self.config.landing_speed_mps, outcome))
    }

    async fn get_estimated_position(&self, agent: &str) -> Result<Position3D, BackendError> {
        let (position, query) = {
            let mut vehicles = self.vehicles.lock();
            let vehicle = vehicles
                .get_mut(agent)
                .ok_or_else(|| BackendError::UnknownVehicle(agent.to_string()))?;
            vehicle.queries += 1;
            (vehicle.position, vehicle.queries)
        };

        let dropped = self.faults.lock().iter().any(|f| match f {
            SimFault::TelemetryDropout {
                agent: a,
                start_query,
                count,
            } => {
                a == agent
                    && query >= *start_query
                    && query < (*start_query).saturating_add(*count)
            }
            SimFault::Unresponsive { agent: a } => a == agent,
            _ => false,
        });

        if dropped {
            Err(BackendError::Rejected {
                agent: agent.to_string(),
                reason: format!("telemetry unavailable (query #{})", query),
            })
        } else {
            Ok(position)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_takeoff_requires_arming() {
        let sim = SimBackend::new(SimConfig::instant());
        sim.add_vehicle("A");
        assert!(sim.takeoff("A").await.is_err());

        sim.set_api_control("A", true).await.unwrap();
        sim.arm_disarm("A", true).await.unwrap();
        sim.takeoff("A").await.unwrap().await.unwrap();
        assert_eq!(sim.position_of("A"), Some(Position3D::new(0.0, 0.0, 3.0)));
    }

    #[tokio::test]
    async fn test_move_and_land() {
        let sim = SimBackend::new(SimConfig::instant());
        sim.add_vehicle("A");
        sim.force_airborne("A", Position3D::new(0.0, 0.0, 10.0));

        let target = Position3D::new(12.0, -4.0, 20.0);
        sim.move_to_position("A", target, 5.0).await.unwrap().await.unwrap();
        assert_eq!(sim.position_of("A"), Some(target));

        sim.land("A").await.unwrap().await.unwrap();
        assert_eq!(sim.position_of("A"), Some(target.with_altitude(0.0)));
        assert_eq!(sim.move_targets("A"), vec![target]);
    }

    #[tokio::test]
    async fn test_telemetry_dropout_window() {
        let sim = SimBackend::new(SimConfig::instant());
        sim.add_vehicle("A");
        sim.add_fault(SimFault::TelemetryDropout {
            agent: "A".into(),
            start_query: 2,
            count: 2,
        });

        assert!(sim.get_estimated_position("A").await.is_ok());
        assert!(sim.get_estimated_position("A").await.is_err());
        assert!(sim.get_estimated_position("A").await.is_err());
        assert!(sim.get_estimated_position("A").await.is_ok());
    }

    #[tokio::test]
    async fn test_unbounded_dropout_does_not_overflow() {
        let sim = SimBackend::new(SimConfig::instant());
        sim.add_vehicle("A");
        sim.add_fault(SimFault::TelemetryDropout {
            agent: "A".into(),
            start_query: 2,
            count: u32::MAX,
        });

        assert!(sim.get_estimated_position("A").await.is_ok());
        assert!(sim.get_estimated_position("A").await.is_err());
        assert!(sim.get_estimated_position("A").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_vehicle() {
        let sim = SimBackend::new(SimConfig::instant());
        assert_eq!(
            sim.get_estimated_position("Ghost").await,
            Err(BackendError::UnknownVehicle("Ghost".into()))
        );
    }

    #[test]
    fn test_fault_from_yaml() {
        let yaml = "kind: command_failure\nagent: Drone2\ncommand: move_to\nnth: 3\n";
        let fault: SimFault = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            fault,
            SimFault::CommandFailure {
                agent: "Drone2".into(),
                command: CommandKind::MoveTo,
                nth: 3
            }
        );
    }
}
