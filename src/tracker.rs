//! # Tracker モジュール
//!
//! 稼働中の機体の最新位置（FleetSnapshot）をキャッシュします。
//! 位置取得はエージェントごとに劣化し、取得に失敗した機体は前回値を保持します。

use std::collections::HashMap;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::gateway::ActuationGateway;
use crate::models::Position3D;

/// 機体名から最新位置への写像
pub type FleetSnapshot = HashMap<String, Position3D>;

/// refresh の結果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshSummary {
    pub updated: Vec<String>,
    /// 取得に失敗し前回値を保持した機体
    pub stale: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PositionTracker {
    snapshot: FleetSnapshot,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定した機体の位置を並行に取得し、スナップショットを更新
    ///
    /// 全体としては失敗しません。
    pub async fn refresh(&mut self, gateway: &ActuationGateway, agents: &[String]) -> RefreshSummary {
        let queries = agents
            .iter()
            .map(|name| async move { (name, gateway.query_position(name).await) });

        let mut summary = RefreshSummary::default();
        for (name, result) in join_all(queries).await {
            match result {
                Ok(position) => {
                    debug!(agent = %name, %position, "位置更新");
                    self.snapshot.insert(name.clone(), position);
                    summary.updated.push(name.clone());
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, "位置取得に失敗、前回値を保持");
                    summary.stale.push(name.clone());
                }
            }
        }
        summary
    }

    /// 最新位置。未観測なら原点。
    pub fn get(&self, name: &str) -> Position3D {
        self.try_get(name).unwrap_or_else(Position3D::origin)
    }

    /// 最新位置。未観測なら None。
    pub fn try_get(&self, name: &str) -> Option<Position3D> {
        self.snapshot.get(name).copied()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.snapshot.contains_key(name)
    }

    pub fn snapshot(&self) -> &FleetSnapshot {
        &self.snapshot
    }
}
