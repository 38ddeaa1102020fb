//! Auxiliary programs started next to the race server.
//!
//! - [`CommandPlugin`]: structured descriptor (`plugins` in the config)
//! - [`parse_legacy_command`]: deprecated `run_on_start` command lines
//! - [`ContentManagerWrapper`] / [`Stracker`]: third-party integrations the
//!   supervisor drives but does not implement

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::protocol::parse_plugin_address;
use crate::store::{ServerOptions, StrackerOptions};
use crate::supervisor::RaceEvent;

/// File name of the sTracker configuration inside its install folder
pub const STRACKER_CONFIG_INI: &str = "stracker.ini";

/// An executable plus its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPlugin {
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl CommandPlugin {
    pub fn new(executable: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments,
        }
    }
}

impl fmt::Display for CommandPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable.display())?;
        for arg in &self.arguments {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Split a deprecated `run_on_start` entry into a plugin descriptor.
///
/// The line is split on single spaces, so executables whose path contains a
/// space cannot be expressed here. Returns `None` for an empty line.
pub fn parse_legacy_command(command: &str) -> Option<CommandPlugin> {
    let mut parts = command.split(' ');
    let executable = parts.next().filter(|p| !p.is_empty())?;
    Some(CommandPlugin::new(
        executable,
        parts.map(String::from).collect(),
    ))
}

/// Companion HTTP service for the Content Manager desktop client.
///
/// `start` blocks for as long as the service runs; the supervisor calls it on
/// the blocking pool and only logs its outcome.
pub trait ContentManagerWrapper: Send + Sync {
    fn start(&self, port: u16, event: Arc<dyn RaceEvent>) -> anyhow::Result<()>;
    fn stop(&self);
}

/// sTracker installation.
pub trait Stracker: Send + Sync {
    fn is_installed(&self) -> bool;
    fn executable_path(&self) -> PathBuf;
    fn folder_path(&self) -> PathBuf;
    /// Write `stracker.ini` from `options`. Must succeed before launch.
    fn write_config(&self, options: &StrackerOptions) -> anyhow::Result<()>;
}

#[derive(thiserror::Error, Debug)]
pub enum StrackerSetupError {
    #[error("sTracker requires the UDP plugin address and local port to be configured")]
    RequiresUdpPluginConfiguration,

    #[error("could not write sTracker configuration: {0}")]
    WriteConfig(anyhow::Error),
}

/// Point sTracker at the server's UDP plugin ports, write its configuration,
/// and return the descriptor to launch it with.
pub fn prepare_stracker(
    stracker: &dyn Stracker,
    server: &ServerOptions,
    mut options: StrackerOptions,
) -> Result<CommandPlugin, StrackerSetupError> {
    let (_, receive_port) = parse_plugin_address(&server.udp_plugin_address)
        .map_err(|_| StrackerSetupError::RequiresUdpPluginConfiguration)?;
    if server.udp_plugin_local_port == 0 {
        return Err(StrackerSetupError::RequiresUdpPluginConfiguration);
    }

    options.send_port = server.udp_plugin_local_port;
    options.receive_port = receive_port;

    stracker
        .write_config(&options)
        .map_err(StrackerSetupError::WriteConfig)?;

    let ini = stracker.folder_path().join(STRACKER_CONFIG_INI);
    Ok(CommandPlugin::new(
        stracker.executable_path(),
        vec!["--stracker_ini".to_string(), ini.to_string_lossy().into_owned()],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeStracker {
        written: Mutex<Option<StrackerOptions>>,
        fail_write: bool,
    }

    impl FakeStracker {
        fn new(fail_write: bool) -> Self {
            Self {
                written: Mutex::new(None),
                fail_write,
            }
        }
    }

    impl Stracker for FakeStracker {
        fn is_installed(&self) -> bool {
            true
        }

        fn executable_path(&self) -> PathBuf {
            PathBuf::from("/opt/stracker/stracker")
        }

        fn folder_path(&self) -> PathBuf {
            PathBuf::from("/opt/stracker")
        }

        fn write_config(&self, options: &StrackerOptions) -> anyhow::Result<()> {
            if self.fail_write {
                anyhow::bail!("read-only filesystem");
            }
            *self.written.lock().unwrap() = Some(options.clone());
            Ok(())
        }
    }

    fn server_options(address: &str, local_port: u16) -> ServerOptions {
        ServerOptions {
            udp_plugin_address: address.to_string(),
            udp_plugin_local_port: local_port,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_legacy_command() {
        let plugin = parse_legacy_command("./kissmyrank --port 9600").unwrap();
        assert_eq!(plugin.executable, PathBuf::from("./kissmyrank"));
        assert_eq!(plugin.arguments, vec!["--port", "9600"]);

        let bare = parse_legacy_command("./relay").unwrap();
        assert!(bare.arguments.is_empty());

        assert!(parse_legacy_command("").is_none());
    }

    #[test]
    fn test_legacy_command_splits_paths_with_spaces() {
        // 알려진 제한: 공백이 포함된 경로는 지원하지 않음
        let plugin = parse_legacy_command("/opt/my plugin/run --fast").unwrap();
        assert_eq!(plugin.executable, PathBuf::from("/opt/my"));
        assert_eq!(plugin.arguments, vec!["plugin/run", "--fast"]);
    }

    #[test]
    fn test_command_plugin_display() {
        let plugin = CommandPlugin::new("bin/relay", vec!["-v".into(), "9000".into()]);
        assert_eq!(plugin.to_string(), "bin/relay -v 9000");
    }

    #[test]
    fn test_prepare_stracker_sets_ports() {
        let stracker = FakeStracker::new(false);
        let plugin = prepare_stracker(
            &stracker,
            &server_options("127.0.0.1:11000", 12000),
            StrackerOptions {
                enable_stracker: true,
                listening_port: 50042,
                ..Default::default()
            },
        )
        .unwrap();

        let written = stracker.written.lock().unwrap().clone().unwrap();
        assert_eq!(written.send_port, 12000);
        assert_eq!(written.receive_port, 11000);
        assert_eq!(written.listening_port, 50042);

        assert_eq!(plugin.executable, PathBuf::from("/opt/stracker/stracker"));
        assert_eq!(plugin.arguments[0], "--stracker_ini");
        assert!(plugin.arguments[1].ends_with("stracker.ini"));
    }

    #[test]
    fn test_prepare_stracker_requires_udp_configuration() {
        let stracker = FakeStracker::new(false);
        let missing_address = prepare_stracker(
            &stracker,
            &server_options("", 12000),
            StrackerOptions::default(),
        );
        assert!(matches!(
            missing_address,
            Err(StrackerSetupError::RequiresUdpPluginConfiguration)
        ));

        let missing_port = prepare_stracker(
            &stracker,
            &server_options("127.0.0.1:11000", 0),
            StrackerOptions::default(),
        );
        assert!(missing_port.is_err());
        assert!(stracker.written.lock().unwrap().is_none());
    }

    #[test]
    fn test_prepare_stracker_write_failure() {
        let stracker = FakeStracker::new(true);
        let result = prepare_stracker(
            &stracker,
            &server_options("127.0.0.1:11000", 12000),
            StrackerOptions::default(),
        );
        assert!(matches!(result, Err(StrackerSetupError::WriteConfig(_))));
    }
}
