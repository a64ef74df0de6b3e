//! # Controller モジュール
//!
//! 編隊ミッションの中核となる状態機械を提供します。
//!
//! 編隊を初期化し、共通高度に揃えた後、ウェイポイント列を順に巡回します。
//! 各フェーズでは稼働中の機体ごとに並行して指令を発行し、全機の完了を
//! 1か所で待ち合わせてから次のフェーズに進みます。
//!
//! ## 状態遷移
//!
//! ```text
//! Initializing → Aligning → Navigating(i) → FailureTriggered → Navigating(i) → … → Completed
//!                                                                     ↓ (常に)
//!                                                                  Landing
//! ```
//!
//! 故障トリガーのウェイポイントでは、リーダーだけを途中まで進めてから故障させ、
//! 残りの機体でそのウェイポイントへの移動を続けます。無効化された機体は
//! 以降の移動ラウンドから除外されます。着陸フェーズで除外されるのは墜落した機体のみです。
//!
//! ## 使用例
//!
//! ```ignore
//! let gateway = ActuationGateway::new(backend, Some(Duration::from_secs(60)));
//! let mut controller = MissionController::new(registry, gateway, mission)?;
//! let report = controller.run().await?;
//! report.print_summary();
//! ```

use std::collections::HashMap;
use std::fmt;

use tracing::{error, info, warn};

use crate::error::MissionError;
use crate::failure::{FailureInjector, FailureOutcome};
use crate::gateway::{ActuationGateway, Command, RoundReport};
use crate::mission::{FailureMode, Mission, Waypoint, WaypointFrame};
use crate::models::{AgentRole, DisableReason, Liveness, Position3D};
use crate::registry::AgentRegistry;
use crate::tracker::PositionTracker;

/// ミッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionState {
    Initializing,
    Aligning,
    Navigating(usize),
    FailureTriggered,
    Completed,
    Landing,
    Failed,
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissionState::Navigating(i) => write!(f, "Navigating({})", i),
            other => write!(f, "{:?}", other),
        }
    }
}

/// ミッション結果
#[derive(Debug, Clone)]
pub struct MissionReport {
    /// Completed または Failed
    pub final_state: MissionState,
    /// 通過した状態（順序通り）
    pub states: Vec<MissionState>,
    /// 機体ごとの到達ウェイポイント数（登録順）
    pub waypoints_reached: Vec<(String, usize)>,
    pub failure: Option<FailureOutcome>,
    pub disabled: Vec<(String, DisableReason)>,
    pub landed: Vec<String>,
    /// 機体単位の指令失敗の総数
    pub command_failures: usize,
    /// ミッションを中断させたエラー
    pub error: Option<MissionError>,
}

impl MissionReport {
    pub fn reached(&self, agent: &str) -> usize {
        self.waypoints_reached
            .iter()
            .find(|(name, _)| name == agent)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn is_completed(&self) -> bool {
        self.final_state == MissionState::Completed
    }

    /// 結果の概要を表示
    pub fn print_summary(&self) {
        println!("=== ミッション結果 ===");
        println!("最終状態: {}", self.final_state);
        if let Some(e) = &self.error {
            println!("中断理由: {}", e);
        }
        match &self.failure {
            Some(outcome) => println!(
                "故障注入: {} → {} (指令完了: {})",
                outcome.leader, outcome.impact, outcome.command_completed
            ),
            None => println!("故障注入: なし"),
        }
        println!();

        println!("=== 機体別 ===");
        for (name, count) in &self.waypoints_reached {
            let status = match self.disabled.iter().find(|(n, _)| n == name) {
                Some((_, reason)) => format!("無効 ({})", reason),
                None if self.landed.contains(name) => "着陸".to_string(),
                None => "未着陸".to_string(),
            };
            println!("  {}: ウェイポイント {}箇所到達, {}", name, count, status);
        }
        println!();
        println!("指令失敗: {}件", self.command_failures);
    }
}

pub struct MissionController {
    registry: AgentRegistry,
    tracker: PositionTracker,
    gateway: ActuationGateway,
    mission: Mission,
    injector: FailureInjector,

    states: Vec<MissionState>,
    reached: HashMap<String, usize>,
    failure: Option<FailureOutcome>,
    trigger_consumed: bool,
    command_failures: usize,
}

impl MissionController {
    pub fn new(
        registry: AgentRegistry,
        gateway: ActuationGateway,
        mission: Mission,
    ) -> Result<Self, MissionError> {
        if registry.is_empty() {
            return Err(MissionError::ConfigInconsistent("fleet is empty".to_string()));
        }
        if let Some(spec) = &mission.failure {
            if registry.leader().is_none() {
                return Err(MissionError::ConfigInconsistent(
                    "failure trigger configured without a leader".to_string(),
                ));
            }
            if spec.mode == FailureMode::Ram && registry.adversary().is_none() {
                return Err(MissionError::ConfigInconsistent(
                    "ram failure configured without an adversary".to_string(),
                ));
            }
        }

        let injector = FailureInjector::from_mission(&mission);
        Ok(Self {
            registry,
            tracker: PositionTracker::new(),
            gateway,
            mission,
            injector,
            states: Vec::new(),
            reached: HashMap::new(),
            failure: None,
            trigger_consumed: false,
            command_failures: 0,
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn states(&self) -> &[MissionState] {
        &self.states
    }

    /// ミッションを実行
    ///
    /// 接続確認の失敗のみが `Err` になります。それ以外の失敗は機体単位で
    /// 吸収され、着陸フェーズは常に実行されます。
    pub async fn run(&mut self) -> Result<MissionReport, MissionError> {
        info!("=== ミッション開始 ===");
        info!(
            "機体: {}機, ウェイポイント: {}箇所",
            self.registry.len(),
            self.mission.waypoints.len()
        );

        if let Err(e) = self.gateway.connect().await {
            error!(error = %e, "バックエンドに接続できません。ミッションを中止します");
            self.enter(MissionState::Failed);
            return Err(e);
        }

        let flight = self.fly().await;
        let final_state = match &flight {
            Ok(()) => MissionState::Completed,
            Err(e) => {
                error!(error = %e, "ミッションを中断します");
                self.enter(MissionState::Failed);
                MissionState::Failed
            }
        };

        let landed = self.land().await;

        info!("=== ミッション終了 ({}) ===", final_state);
        Ok(self.report(final_state, landed, flight.err()))
    }

    async fn fly(&mut self) -> Result<(), MissionError> {
        self.initialize().await?;
        self.align().await;
        for index in 0..self.mission.waypoints.len() {
            self.navigate(index).await?;
        }
        self.enter(MissionState::Completed);
        Ok(())
    }

    /// 全機の制御有効化・アーム・離陸
    async fn initialize(&mut self) -> Result<(), MissionError> {
        self.enter(MissionState::Initializing);

        let orders = self
            .registry
            .names()
            .into_iter()
            .map(|name| {
                (
                    name,
                    vec![Command::EnableControl, Command::Arm, Command::Takeoff],
                )
            })
            .collect();
        let report = self
            .gateway
            .run_round(MissionState::Initializing, orders)
            .await;
        self.absorb(&report);

        let agents = self.registry.operational_agents();
        self.tracker.refresh(&self.gateway, &agents).await;

        for name in agents {
            if !self.tracker.is_known(&name) {
                warn!(agent = %name, "初期化後も位置が不明なため機体を除外します");
                self.registry
                    .mark_disabled(&name, DisableReason::TelemetryLost)?;
            }
        }

        info!(
            "初期化完了: 稼働 {}/{}機",
            self.registry.operational_agents().len(),
            self.registry.len()
        );
        Ok(())
    }

    /// 水平移動前に共通高度へ揃える
    async fn align(&mut self) {
        self.enter(MissionState::Aligning);

        let altitude = self.mission.cruise_altitude;
        let speed = self.mission.speeds.alignment;
        let mut orders = Vec::new();

        for agent in self.registry.agents().iter().filter(|a| a.is_operational()) {
            let target = match (agent.role, self.mission.adversary_station) {
                (AgentRole::Adversary, Some(station)) => station,
                _ => match self.tracker.try_get(&agent.name) {
                    Some(current) => current.with_altitude(altitude),
                    None => {
                        let e = MissionError::PositionUnknown(agent.name.clone());
                        warn!(agent = %agent.name, error = %e, "高度合わせをスキップ");
                        continue;
                    }
                },
            };
            orders.push((agent.name.clone(), Command::MoveTo { target, speed }));
        }

        let report = self.gateway.dispatch(MissionState::Aligning, orders).await;
        self.absorb(&report);
        self.refresh().await;
    }

    /// i 番目のウェイポイントへの移動
    async fn navigate(&mut self, index: usize) -> Result<(), MissionError> {
        let phase = MissionState::Navigating(index);
        self.enter(phase);
        let waypoint = self.mission.waypoints[index];
        info!(waypoint = index, position = %waypoint.position, "ウェイポイントへ移動");

        if self.mission.is_trigger(index) && !self.trigger_consumed {
            self.trigger_consumed = true;
            self.enter(MissionState::FailureTriggered);
            self.inject_failure(index, &waypoint).await?;
            self.enter(phase);
        }

        let speed = self.mission.leg_speed(index);
        let orders: Vec<(String, Command)> = self
            .registry
            .operational_flyers()
            .into_iter()
            .map(|name| {
                let target = self.leg_target(&name, &waypoint);
                (name, Command::MoveTo { target, speed })
            })
            .collect();

        let report = self.gateway.dispatch(phase, orders).await;
        for name in &report.completed {
            *self.reached.entry(name.clone()).or_insert(0) += 1;
        }
        self.absorb(&report);
        self.refresh().await;
        Ok(())
    }

    /// リーダーを途中まで進めてから故障させる
    ///
    /// 途中位置を計算できない場合は故障注入を行わず、トリガーは消費済みとなります。
    async fn inject_failure(&mut self, index: usize, waypoint: &Waypoint) -> Result<(), MissionError> {
        let Some(spec) = self.mission.failure else {
            return Ok(());
        };
        let Some(leader) = self.registry.leader().map(|a| a.name.clone()) else {
            return Ok(());
        };
        if !self.registry.get(&leader).is_some_and(|a| a.is_operational()) {
            warn!(agent = %leader, "リーダーは既に無効化されているため故障注入を行いません");
            return Ok(());
        }

        let Some(start) = self.tracker.try_get(&leader) else {
            let e = MissionError::PositionUnknown(leader.clone());
            warn!(agent = %leader, error = %e, "途中位置を計算できないため故障注入をスキップ");
            return Ok(());
        };

        let partial = start.lerp(&self.leg_target(&leader, waypoint), spec.progress);
        info!(
            agent = %leader,
            waypoint = index,
            progress = spec.progress,
            target = %partial,
            "リーダーを途中位置へ移動"
        );
        let command = Command::MoveTo {
            target: partial,
            speed: self.mission.leg_speed(index),
        };
        if let Err(e) = self
            .gateway
            .execute(&leader, command, MissionState::FailureTriggered)
            .await
        {
            warn!(agent = %leader, error = %e, "途中位置への移動に失敗");
            self.command_failures += 1;
        }
        self.tracker
            .refresh(&self.gateway, std::slice::from_ref(&leader))
            .await;

        match self
            .injector
            .trigger_leader_failure(&mut self.registry, &self.tracker, &self.gateway)
            .await
        {
            Ok(outcome) => {
                if !outcome.command_completed {
                    self.command_failures += 1;
                }
                self.failure = Some(outcome);
                Ok(())
            }
            Err(MissionError::PositionUnknown(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 墜落していない全機を着陸させ、ディスアーム・制御解除する
    ///
    /// 着陸・ディスアーム・制御解除はそれぞれ別ラウンドで、
    /// 前のラウンドの成否に関係なく同じ機体集合に発行します。
    async fn land(&mut self) -> Vec<String> {
        self.enter(MissionState::Landing);

        let agents = self.registry.landing_candidates();
        let mut landed = Vec::new();
        for command in [Command::Land, Command::Disarm, Command::DisableControl] {
            let orders = agents.iter().map(|name| (name.clone(), command)).collect();
            let report = self.gateway.dispatch(MissionState::Landing, orders).await;
            self.absorb(&report);
            if command == Command::Land {
                landed = report.completed;
            }
        }

        info!("着陸完了: {}/{}機", landed.len(), agents.len());
        landed
    }

    /// ウェイポイントを機体ローカル座標に変換
    fn leg_target(&self, name: &str, waypoint: &Waypoint) -> Position3D {
        match (self.mission.frame, self.registry.get(name)) {
            (WaypointFrame::World, Some(agent)) => agent.to_local(&waypoint.position),
            _ => waypoint.position,
        }
    }

    async fn refresh(&mut self) {
        let agents = self.registry.operational_agents();
        self.tracker.refresh(&self.gateway, &agents).await;
    }

    fn absorb(&mut self, report: &RoundReport) {
        self.command_failures += report.failed.len();
    }

    fn enter(&mut self, state: MissionState) {
        info!(state = %state, "状態遷移");
        self.states.push(state);
    }

    fn report(
        &self,
        final_state: MissionState,
        landed: Vec<String>,
        error: Option<MissionError>,
    ) -> MissionReport {
        let waypoints_reached = self
            .registry
            .agents()
            .iter()
            .map(|a| (a.name.clone(), self.reached.get(&a.name).copied().unwrap_or(0)))
            .collect();
        let disabled = self
            .registry
            .agents()
            .iter()
            .filter_map(|a| match a.liveness {
                Liveness::Disabled(reason) => Some((a.name.clone(), reason)),
                Liveness::Operational => None,
            })
            .collect();

        MissionReport {
            final_state,
            states: self.states.clone(),
            waypoints_reached,
            failure: self.failure.clone(),
            disabled,
            landed,
            command_failures: self.command_failures,
            error,
        }
    }
}
