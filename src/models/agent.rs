use std::fmt;

use crate::models::common::Position3D;

/// エージェントの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// ミッションリーダー（無効化されても役割は移譲されない）
    Leader,
    /// 通常の編隊機
    Follower,
    /// 体当たりシナリオの標的機（ウェイポイントには参加しない）
    Adversary,
}

/// 稼働状態。`Operational → Disabled` の一方向にのみ遷移します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Operational,
    Disabled(DisableReason),
}

/// 無効化された理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    /// 故障注入による墜落
    Crashed,
    /// 初期化後に位置が一度も取得できなかった
    TelemetryLost,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::Crashed => write!(f, "crashed"),
            DisableReason::TelemetryLost => write!(f, "telemetry lost"),
        }
    }
}

/// 編隊を構成する機体
#[derive(Debug, Clone)]
pub struct Agent {
    /// 機体名（一意）
    pub name: String,
    pub role: AgentRole,
    pub liveness: Liveness,
    /// ワールド座標系でのスポーン地点
    pub spawn: Position3D,
}

impl Agent {
    pub fn new(name: String, role: AgentRole, spawn: Position3D) -> Self {
        Self {
            name,
            role,
            liveness: Liveness::Operational,
            spawn,
        }
    }

    pub fn is_operational(&self) -> bool {
        self.liveness == Liveness::Operational
    }

    pub fn is_leader(&self) -> bool {
        self.role == AgentRole::Leader
    }

    /// ワールド座標をこの機体のローカル座標に変換
    pub fn to_local(&self, world: &Position3D) -> Position3D {
        *world - self.spawn
    }
}
