use std::path::{Path, PathBuf};

pub const AGENT_LABEL: &str = "dev.pullwatch.agent";
pub const AGENT_SOCKET: &str = "agent.sock";

pub fn pullwatch_root(home: &Path) -> PathBuf {
    home.join(".pullwatch")
}

pub fn socket_path(home: &Path) -> PathBuf {
    pullwatch_root(home).join(AGENT_SOCKET)
}
