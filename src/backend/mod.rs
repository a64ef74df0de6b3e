// 外部飛行シミュレータの代替実装
pub mod sim;

pub use sim::{SimBackend, SimConfig, SimFault};
