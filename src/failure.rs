//! # Failure モジュール
//!
//! ミッション途中でリーダー機を無効化します。終端指令（墜落または体当たり）を
//! 発行して完了を待ち、その後レジストリ上で無効化します。一度きりの不可逆な操作です。

use tracing::{error, info, warn};

use crate::controller::MissionState;
use crate::error::MissionError;
use crate::gateway::{ActuationGateway, Command};
use crate::mission::{FailureMode, Mission};
use crate::models::{DisableReason, Position3D};
use crate::registry::AgentRegistry;
use crate::tracker::PositionTracker;

/// 故障注入の結果
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub leader: String,
    /// 終端指令の目標位置（リーダーのローカル座標）
    pub impact: Position3D,
    /// 終端指令が完了したか
    pub command_completed: bool,
}

#[derive(Debug, Clone)]
pub struct FailureInjector {
    mode: FailureMode,
    crash_speed: f64,
    ground_altitude: f64,
}

impl FailureInjector {
    pub fn new(mode: FailureMode, crash_speed: f64, ground_altitude: f64) -> Self {
        Self {
            mode,
            crash_speed,
            ground_altitude,
        }
    }

    pub fn from_mission(mission: &Mission) -> Self {
        let mode = mission.failure.map(|f| f.mode).unwrap_or_default();
        Self::new(mode, mission.speeds.crash, mission.ground_altitude)
    }

    /// リーダーを故障させる
    ///
    /// リーダーの位置が不明な場合は何もせず `PositionUnknown` を返します。
    /// 終端指令自体が失敗してもリーダーは無効化されます。
    pub async fn trigger_leader_failure(
        &self,
        registry: &mut AgentRegistry,
        tracker: &PositionTracker,
        gateway: &ActuationGateway,
    ) -> Result<FailureOutcome, MissionError> {
        let leader = registry
            .leader()
            .map(|a| a.name.clone())
            .ok_or_else(|| MissionError::ConfigInconsistent("no leader registered".to_string()))?;

        let impact = match self.impact_point(registry, tracker, &leader) {
            Ok(impact) => impact,
            Err(e) => {
                warn!(agent = %leader, error = %e, "故障注入をスキップ");
                return Err(e);
            }
        };

        info!(agent = %leader, %impact, mode = ?self.mode, "リーダー故障を注入");
        let command = Command::MoveTo {
            target: impact,
            speed: self.crash_speed,
        };
        let command_completed = match gateway
            .execute(&leader, command, MissionState::FailureTriggered)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(agent = %leader, error = %e, "終端指令が失敗しました");
                false
            }
        };

        registry.mark_disabled(&leader, DisableReason::Crashed)?;

        Ok(FailureOutcome {
            leader,
            impact,
            command_completed,
        })
    }

    fn impact_point(
        &self,
        registry: &AgentRegistry,
        tracker: &PositionTracker,
        leader: &str,
    ) -> Result<Position3D, MissionError> {
        let position = tracker
            .try_get(leader)
            .ok_or_else(|| MissionError::PositionUnknown(leader.to_string()))?;

        match self.mode {
            FailureMode::Crash => Ok(position.with_altitude(self.ground_altitude)),
            FailureMode::Ram => {
                let adversary = registry.adversary().ok_or_else(|| {
                    MissionError::ConfigInconsistent("ram failure needs an adversary".to_string())
                })?;
                let leader_spawn = registry
                    .get(leader)
                    .map(|a| a.spawn)
                    .ok_or_else(|| MissionError::UnknownAgent(leader.to_string()))?;
                let adversary_position = tracker
                    .try_get(&adversary.name)
                    .ok_or_else(|| MissionError::PositionUnknown(adversary.name.clone()))?;

                // 標的機のローカル座標をリーダーのローカル座標に変換
                Ok(adversary.spawn - leader_spawn + adversary_position)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimConfig, SimFault};
    use crate::gateway::CommandKind;
    use crate::models::{AgentRole, Liveness};
    use std::sync::Arc;

    struct Fixture {
        sim: Arc<SimBackend>,
        gateway: ActuationGateway,
        registry: AgentRegistry,
        tracker: PositionTracker,
    }

    async fn fixture() -> Fixture {
        let sim = Arc::new(SimBackend::new(SimConfig::instant()));
        let mut registry = AgentRegistry::new();
        registry
            .register_at("Drone1", AgentRole::Follower, Position3D::new(4.0, 0.0, 0.0))
            .unwrap();
        registry
            .register_at("Drone3", AgentRole::Leader, Position3D::new(12.0, 0.0, 0.0))
            .unwrap();
        registry
            .register_at("Evil", AgentRole::Adversary, Position3D::new(0.0, 0.0, 0.0))
            .unwrap();
        for name in registry.names() {
            sim.add_vehicle(&name);
        }
        sim.force_airborne("Drone1", Position3D::new(1.0, 1.0, 20.0));
        sim.force_airborne("Drone3", Position3D::new(7.5, -2.0, 20.0));
        sim.force_airborne("Evil", Position3D::new(0.0, 0.0, 10.0));

        let gateway = ActuationGateway::new(sim.clone(), None);
        Fixture {
            sim,
            gateway,
            registry,
            tracker: PositionTracker::new(),
        }
    }

    #[tokio::test]
    async fn test_crash_descends_to_ground_and_disables() {
        let mut f = fixture().await;
        f.tracker.refresh(&f.gateway, &f.registry.names()).await;
        let injector = FailureInjector::new(FailureMode::Crash, 10.0, 0.0);

        let outcome = injector
            .trigger_leader_failure(&mut f.registry, &f.tracker, &f.gateway)
            .await
            .unwrap();

        assert_eq!(outcome.leader, "Drone3");
        assert_eq!(outcome.impact, Position3D::new(7.5, -2.0, 0.0));
        assert!(outcome.command_completed);
        assert_eq!(f.sim.position_of("Drone3"), Some(outcome.impact));
        assert_eq!(
            f.registry.liveness("Drone3").unwrap(),
            Liveness::Disabled(DisableReason::Crashed)
        );
        assert!(f.registry.liveness("Drone1").unwrap() == Liveness::Operational);
    }

    #[tokio::test]
    async fn test_unknown_position_is_noop() {
        let mut f = fixture().await;
        let injector = FailureInjector::new(FailureMode::Crash, 10.0, 0.0);

        let result = injector
            .trigger_leader_failure(&mut f.registry, &f.tracker, &f.gateway)
            .await;

        assert_eq!(result, Err(MissionError::PositionUnknown("Drone3".to_string())));
        assert!(f.registry.get("Drone3").unwrap().is_operational());
        assert!(f.sim.issued("Drone3").is_empty());
    }

    #[tokio::test]
    async fn test_failed_crash_command_still_disables() {
        let mut f = fixture().await;
        f.tracker.refresh(&f.gateway, &f.registry.names()).await;
        f.sim.add_fault(SimFault::CommandFailure {
            agent: "Drone3".into(),
            command: CommandKind::MoveTo,
            nth: 0,
        });
        let injector = FailureInjector::new(FailureMode::Crash, 10.0, 0.0);

        let outcome = injector
            .trigger_leader_failure(&mut f.registry, &f.tracker, &f.gateway)
            .await
            .unwrap();

        assert!(!outcome.command_completed);
        assert!(!f.registry.get("Drone3").unwrap().is_operational());
    }

    #[tokio::test]
    async fn test_second_trigger_keeps_disabled() {
        let mut f = fixture().await;
        f.tracker.refresh(&f.gateway, &f.registry.names()).await;
        let injector = FailureInjector::new(FailureMode::Crash, 10.0, 0.0);

        injector
            .trigger_leader_failure(&mut f.registry, &f.tracker, &f.gateway)
            .await
            .unwrap();
        injector
            .trigger_leader_failure(&mut f.registry, &f.tracker, &f.gateway)
            .await
            .unwrap();

        assert_eq!(
            f.registry.liveness("Drone3").unwrap(),
            Liveness::Disabled(DisableReason::Crashed)
        );
    }

    #[tokio::test]
    async fn test_ram_targets_adversary_in_leader_frame() {
        let mut f = fixture().await;
        f.tracker.refresh(&f.gateway, &f.registry.names()).await;
        let injector = FailureInjector::new(FailureMode::Ram, 10.0, 0.0);

        let outcome = injector
            .trigger_leader_failure(&mut f.registry, &f.tracker, &f.gateway)
            .await
            .unwrap();

        // Evil のスポーン (0,0) - Drone3 のスポーン (12,0) + Evil のローカル位置 (0,0,10)
        assert_eq!(outcome.impact, Position3D::new(-12.0, 0.0, 10.0));
    }
}
