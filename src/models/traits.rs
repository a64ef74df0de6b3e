use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::BackendError;
use crate::models::common::Position3D;

/// 非同期コマンドの完了を待つハンドル（`join` に相当）
pub type MotionHandle = BoxFuture<'static, Result<(), BackendError>>;

/// 飛行シミュレータ（外部バックエンド）のインターフェース
///
/// 機体ごとに絶対位置と速度による移動指令を受け付け、要求に応じて
/// 推定位置を返します。位置は全て機体ローカル座標系です。
#[async_trait]
pub trait IFlightBackend: Send + Sync {
    /// 接続確認
    async fn confirm_connection(&self) -> Result<(), BackendError>;

    /// API制御の有効化/無効化
    async fn set_api_control(&self, agent: &str, enabled: bool) -> Result<(), BackendError>;

    /// アーム/ディスアーム
    async fn arm_disarm(&self, agent: &str, armed: bool) -> Result<(), BackendError>;

    /// 離陸指令
    async fn takeoff(&self, agent: &str) -> Result<MotionHandle, BackendError>;

    /// 絶対位置への移動指令
    async fn move_to_position(
        &self,
        agent: &str,
        target: Position3D,
        speed: f64,
    ) -> Result<MotionHandle, BackendError>;

    /// 着陸指令
    async fn land(&self, agent: &str) -> Result<MotionHandle, BackendError>;

    /// 推定位置の取得
    async fn get_estimated_position(&self, agent: &str) -> Result<Position3D, BackendError>;
}
