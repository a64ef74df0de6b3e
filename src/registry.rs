//! # Registry モジュール
//!
//! 機体の識別子・役割・稼働状態を保持します。登録順が全ての列挙順になります。

use tracing::{debug, info};

use crate::error::MissionError;
use crate::models::{Agent, AgentRole, DisableReason, Liveness, Position3D};

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// スポーン地点を原点として機体を登録
    pub fn register(&mut self, name: &str, role: AgentRole) -> Result<(), MissionError> {
        self.register_at(name, role, Position3D::origin())
    }

    /// スポーン地点付きで機体を登録
    ///
    /// 同名の機体が既に存在する場合は `DuplicateAgent`。
    /// リーダーは一機のみ登録できます。
    pub fn register_at(
        &mut self,
        name: &str,
        role: AgentRole,
        spawn: Position3D,
    ) -> Result<(), MissionError> {
        if self.get(name).is_some() {
            return Err(MissionError::DuplicateAgent(name.to_string()));
        }
        if role == AgentRole::Leader {
            if let Some(existing) = self.leader() {
                return Err(MissionError::ConfigInconsistent(format!(
                    "leader already assigned to {}",
                    existing.name
                )));
            }
        }

        debug!(agent = name, ?role, "機体登録");
        self.agents.push(Agent::new(name.to_string(), role, spawn));
        Ok(())
    }

    /// 機体を無効化する。既に無効なら何もしない。
    pub fn mark_disabled(&mut self, name: &str, reason: DisableReason) -> Result<(), MissionError> {
        let agent = self
            .agents
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| MissionError::UnknownAgent(name.to_string()))?;

        if agent.is_operational() {
            agent.liveness = Liveness::Disabled(reason);
            info!(agent = name, %reason, "機体を無効化");
        }
        Ok(())
    }

    /// 稼働中の機体名（登録順）
    pub fn operational_agents(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|a| a.is_operational())
            .map(|a| a.name.clone())
            .collect()
    }

    /// ウェイポイント移動に参加する稼働中の機体（標的機を除く）
    pub fn operational_flyers(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|a| a.is_operational() && a.role != AgentRole::Adversary)
            .map(|a| a.name.clone())
            .collect()
    }

    /// 着陸フェーズで指令を受ける機体（墜落した機体のみ除く、登録順）
    ///
    /// 位置取得を失った機体はウェイポイント移動からは外れますが、
    /// 飛行中の可能性があるため着陸対象に含めます。
    pub fn landing_candidates(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|a| a.liveness != Liveness::Disabled(DisableReason::Crashed))
            .map(|a| a.name.clone())
            .collect()
    }

    /// リーダー（稼働状態に関係なく返す）
    pub fn leader(&self) -> Option<&Agent> {
        self.agents.iter().find(|a| a.is_leader())
    }

    /// 標的機
    pub fn adversary(&self) -> Option<&Agent> {
        self.agents.iter().find(|a| a.role == AgentRole::Adversary)
    }

    pub fn get(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn liveness(&self, name: &str) -> Result<Liveness, MissionError> {
        self.get(name)
            .map(|a| a.liveness)
            .ok_or_else(|| MissionError::UnknownAgent(name.to_string()))
    }

    /// 全機体の名前（登録順）
    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
