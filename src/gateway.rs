//! # Gateway モジュール
//!
//! 機体ごとの動作指令をバックエンドに発行し、その完了を待ち合わせます。
//!
//! ## ラウンド処理
//!
//! 各フェーズでは機体ごとに1つの並行タスクを発行し、全タスクの完了（成功・失敗）を
//! 1か所でまとめて待ちます。ある機体の失敗が他の機体の待ち合わせを止めたり
//! 打ち切ったりすることはありません。発行・完了待ちのいずれにもタイムアウトを
//! 設定でき、タイムアウトはバックエンドエラーと同じ扱いになります。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::controller::MissionState;
use crate::error::{BackendError, MissionError};
use crate::models::{IFlightBackend, MotionHandle, Position3D};

/// 機体への指令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Arm,
    Disarm,
    EnableControl,
    DisableControl,
    Takeoff,
    MoveTo { target: Position3D, speed: f64 },
    Land,
}

/// 指令の種類（故障設定やログで使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ApiControl,
    ArmDisarm,
    Takeoff,
    MoveTo,
    Land,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Arm => write!(f, "arm"),
            Command::Disarm => write!(f, "disarm"),
            Command::EnableControl => write!(f, "enable_control"),
            Command::DisableControl => write!(f, "disable_control"),
            Command::Takeoff => write!(f, "takeoff"),
            Command::MoveTo { target, speed } => write!(f, "move_to {} @ {:.1}m/s", target, speed),
            Command::Land => write!(f, "land"),
        }
    }
}

/// 発行済み指令のハンドル
///
/// 制御系の指令（アーム・API制御）は発行時点で完了しているため
/// `completion` を持ちません。
pub struct CommandHandle {
    pub agent: String,
    pub command: Command,
    pub phase: MissionState,
    completion: Option<MotionHandle>,
}

impl fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandle")
            .field("agent", &self.agent)
            .field("command", &self.command)
            .field("phase", &self.phase)
            .field("pending", &self.completion.is_some())
            .finish()
    }
}

/// 1ラウンドの結果
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub phase: MissionState,
    /// 全指令が完了した機体（発行順）
    pub completed: Vec<String>,
    /// 失敗した機体ごとのエラー
    pub failed: Vec<MissionError>,
}

impl RoundReport {
    fn new(phase: MissionState) -> Self {
        Self {
            phase,
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn succeeded(&self, agent: &str) -> bool {
        self.completed.iter().any(|a| a == agent)
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, agent: String, result: Result<(), MissionError>) {
        match result {
            Ok(()) => self.completed.push(agent),
            Err(e) => {
                warn!(agent = %agent, phase = %self.phase, error = %e, "コマンド失敗");
                self.failed.push(e);
            }
        }
    }
}

/// バックエンドへの指令ゲートウェイ
#[derive(Clone)]
pub struct ActuationGateway {
    backend: Arc<dyn IFlightBackend>,
    command_timeout: Option<Duration>,
}

impl ActuationGateway {
    pub fn new(backend: Arc<dyn IFlightBackend>, command_timeout: Option<Duration>) -> Self {
        Self {
            backend,
            command_timeout,
        }
    }

    /// 接続確認。失敗はミッション全体を中止させる唯一のエラー。
    pub async fn connect(&self) -> Result<(), MissionError> {
        self.with_deadline(self.backend.confirm_connection())
            .await
            .map_err(MissionError::BackendUnavailable)
    }

    /// 指令を発行してハンドルを返す
    ///
    /// 発行自体の失敗（バックエンド到達不能など）はここで `CommandFailed` になります。
    pub async fn submit(
        &self,
        agent: &str,
        command: Command,
        phase: MissionState,
    ) -> Result<CommandHandle, MissionError> {
        debug!(agent, %phase, %command, "コマンド発行");

        let backend = &self.backend;
        let issued = match command {
            Command::EnableControl => self
                .with_deadline(backend.set_api_control(agent, true))
                .await
                .map(|_| None),
            Command::DisableControl => self
                .with_deadline(backend.set_api_control(agent, false))
                .await
                .map(|_| None),
            Command::Arm => self
                .with_deadline(backend.arm_disarm(agent, true))
                .await
                .map(|_| None),
            Command::Disarm => self
                .with_deadline(backend.arm_disarm(agent, false))
                .await
                .map(|_| None),
            Command::Takeoff => self.with_deadline(backend.takeoff(agent)).await.map(Some),
            Command::MoveTo { target, speed } => self
                .with_deadline(backend.move_to_position(agent, target, speed))
                .await
                .map(Some),
            Command::Land => self.with_deadline(backend.land(agent)).await.map(Some),
        };

        let completion = issued.map_err(|source| MissionError::CommandFailed {
            agent: agent.to_string(),
            phase,
            source,
        })?;

        Ok(CommandHandle {
            agent: agent.to_string(),
            command,
            phase,
            completion,
        })
    }

    /// 1つのハンドルの完了を待つ
    pub async fn join(&self, handle: CommandHandle) -> Result<(), MissionError> {
        let CommandHandle {
            agent,
            phase,
            completion,
            ..
        } = handle;

        match completion {
            None => Ok(()),
            Some(motion) => self
                .with_deadline(motion)
                .await
                .map_err(|source| MissionError::CommandFailed { agent, phase, source }),
        }
    }

    /// 全ハンドルの完了を待つ。個々の失敗は記録され、他の待ち合わせは継続します。
    pub async fn await_all(&self, phase: MissionState, handles: Vec<CommandHandle>) -> RoundReport {
        let waits = handles.into_iter().map(|handle| async move {
            let agent = handle.agent.clone();
            (agent, self.join(handle).await)
        });

        let mut report = RoundReport::new(phase);
        for (agent, result) in join_all(waits).await {
            report.record(agent, result);
        }
        report
    }

    /// 発行して完了まで待つ
    pub async fn execute(
        &self,
        agent: &str,
        command: Command,
        phase: MissionState,
    ) -> Result<(), MissionError> {
        let handle = self.submit(agent, command, phase).await?;
        self.join(handle).await
    }

    /// 機体ごとに1つの指令を並行発行し、全完了を待つ
    ///
    /// 発行に失敗した機体はそのラウンドの待ち合わせ対象から外れます。
    pub async fn dispatch(&self, phase: MissionState, orders: Vec<(String, Command)>) -> RoundReport {
        let submissions = orders
            .iter()
            .map(|(agent, command)| self.submit(agent, *command, phase));

        let mut rejected = RoundReport::new(phase);
        let mut handles = Vec::new();
        for ((agent, _), result) in orders.iter().zip(join_all(submissions).await) {
            match result {
                Ok(handle) => handles.push(handle),
                Err(e) => rejected.record(agent.clone(), Err(e)),
            }
        }

        let mut report = self.await_all(phase, handles).await;
        report.failed.extend(rejected.failed);
        report
    }

    /// 機体ごとの指令列を並行実行し、全完了を待つ
    ///
    /// 各機体の指令列は最初に失敗した指令で打ち切られます。
    pub async fn run_round(
        &self,
        phase: MissionState,
        orders: Vec<(String, Vec<Command>)>,
    ) -> RoundReport {
        let chains = orders.into_iter().map(|(agent, commands)| async move {
            let mut result = Ok(());
            for command in commands {
                if let Err(e) = self.execute(&agent, command, phase).await {
                    result = Err(e);
                    break;
                }
            }
            (agent, result)
        });

        let mut report = RoundReport::new(phase);
        for (agent, result) in join_all(chains).await {
            report.record(agent, result);
        }
        report
    }

    /// 推定位置の取得
    pub async fn query_position(&self, agent: &str) -> Result<Position3D, BackendError> {
        self.with_deadline(self.backend.get_estimated_position(agent))
            .await
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(BackendError::TimedOut(limit))),
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimConfig, SimFault};

    fn gateway_with(sim: &Arc<SimBackend>, timeout: Option<Duration>) -> ActuationGateway {
        ActuationGateway::new(sim.clone(), timeout)
    }

    fn airborne_sim(names: &[&str]) -> Arc<SimBackend> {
        let sim = Arc::new(SimBackend::new(SimConfig::instant()));
        for name in names {
            sim.add_vehicle(name);
            sim.force_airborne(name, Position3D::new(0.0, 0.0, 10.0));
        }
        sim
    }

    fn move_orders(names: &[&str], target: Position3D) -> Vec<(String, Command)> {
        names
            .iter()
            .map(|n| (n.to_string(), Command::MoveTo { target, speed: 5.0 }))
            .collect()
    }

    #[tokio::test]
    async fn test_dispatch_moves_every_agent() {
        let names = ["A", "B", "C"];
        let sim = airborne_sim(&names);
        let gateway = gateway_with(&sim, None);
        let target = Position3D::new(10.0, 5.0, 20.0);

        let report = gateway
            .dispatch(MissionState::Navigating(0), move_orders(&names, target))
            .await;

        assert!(report.is_clean());
        assert_eq!(report.completed, vec!["A", "B", "C"]);
        for name in names {
            assert_eq!(sim.position_of(name), Some(target));
        }
    }

    #[tokio::test]
    async fn test_join_failure_does_not_stall_others() {
        let names = ["A", "B", "C"];
        let sim = airborne_sim(&names);
        sim.add_fault(SimFault::CommandFailure {
            agent: "B".into(),
            command: CommandKind::MoveTo,
            nth: 0,
        });
        let gateway = gateway_with(&sim, None);
        let target = Position3D::new(1.0, 1.0, 10.0);

        let report = gateway
            .dispatch(MissionState::Navigating(0), move_orders(&names, target))
            .await;

        assert_eq!(report.completed, vec!["A", "C"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].agent(), Some("B"));
        assert!(!report.succeeded("B"));
        assert_eq!(sim.position_of("A"), Some(target));
    }

    #[tokio::test]
    async fn test_submit_failure_excludes_agent_from_round() {
        let names = ["A", "B"];
        let sim = airborne_sim(&names);
        sim.add_fault(SimFault::Unresponsive { agent: "A".into() });
        let gateway = gateway_with(&sim, None);

        let result = gateway
            .submit("A", Command::Land, MissionState::Landing)
            .await;
        assert!(matches!(result, Err(MissionError::CommandFailed { .. })));

        let report = gateway
            .dispatch(MissionState::Aligning, move_orders(&names, Position3D::new(0.0, 0.0, 20.0)))
            .await;
        assert_eq!(report.completed, vec!["B"]);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_hung_command_times_out_per_agent() {
        let names = ["A", "B"];
        let sim = airborne_sim(&names);
        sim.add_fault(SimFault::CommandHang {
            agent: "A".into(),
            command: CommandKind::MoveTo,
            nth: 1,
        });
        let gateway = gateway_with(&sim, Some(Duration::from_millis(50)));

        let report = gateway
            .dispatch(MissionState::Navigating(2), move_orders(&names, Position3D::new(2.0, 0.0, 10.0)))
            .await;

        assert_eq!(report.completed, vec!["B"]);
        match &report.failed[0] {
            MissionError::CommandFailed { agent, phase, source } => {
                assert_eq!(agent, "A");
                assert_eq!(*phase, MissionState::Navigating(2));
                assert!(matches!(source, BackendError::TimedOut(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_round_stops_chain_at_first_failure() {
        let sim = Arc::new(SimBackend::new(SimConfig::instant()));
        sim.add_vehicle("A");
        sim.add_vehicle("B");
        sim.add_fault(SimFault::CommandFailure {
            agent: "A".into(),
            command: CommandKind::ArmDisarm,
            nth: 1,
        });
        let gateway = gateway_with(&sim, None);
        let chain = vec![Command::EnableControl, Command::Arm, Command::Takeoff];

        let report = gateway
            .run_round(
                MissionState::Initializing,
                vec![("A".into(), chain.clone()), ("B".into(), chain)],
            )
            .await;

        assert_eq!(report.completed, vec!["B"]);
        assert!(!sim.issued("A").contains(&CommandKind::Takeoff));
        assert!(sim.position_of("B").unwrap().z > 0.0);
    }

    #[tokio::test]
    async fn test_connect_reports_backend_unavailable() {
        let sim = Arc::new(SimBackend::new(SimConfig {
            reachable: false,
            ..SimConfig::instant()
        }));
        let gateway = gateway_with(&sim, None);
        assert!(matches!(
            gateway.connect().await,
            Err(MissionError::BackendUnavailable(_))
        ));
    }
}
