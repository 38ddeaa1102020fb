pub mod config;
pub mod plugin;
pub mod protocol; // 서버 UDP 플러그인 프로토콜 릴레이
pub mod store;
pub mod supervisor;
pub mod utils;

pub use config::SupervisorConfig;
pub use protocol::{UdpCallback, UdpMessage};
pub use supervisor::{Collaborators, RaceEvent, ServerProcess, State, SupervisorError, UdpAddressing};
