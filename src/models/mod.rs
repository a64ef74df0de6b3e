// 基本的なデータ型と数学ユーティリティ
pub mod common;

// バックエンドの基本インターフェース（trait）定義
pub mod traits;

// 機体モデル
pub mod agent;

// 便利な re-export
pub use agent::{Agent, AgentRole, DisableReason, Liveness};
pub use common::*;
pub use traits::*;
