//! Detached launches in the user's terminal application.
//!
//! A launch here is fire-and-forget: the terminal is spawned in its own process
//! group, no handle is kept, and nothing about it reaches the status store.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::TerminalError;
use crate::launch::LaunchCommand;

/// Terminal applications known to the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalPreset {
    WindowsTerminal,
    PowerShell,
    Cmd,
    Warp,
    MacTerminal,
    ITerm2,
    Custom,
}

impl Default for TerminalPreset {
    fn default() -> Self {
        if cfg!(windows) {
            Self::WindowsTerminal
        } else if cfg!(target_os = "macos") {
            Self::MacTerminal
        } else {
            Self::Custom
        }
    }
}

/// `[terminal]` section of the config file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub preset: TerminalPreset,
    /// Program used by the `custom` preset.
    pub custom_path: String,
    /// Arguments for the custom program. `{command}`, `{dir}` and
    /// `{full_command}` are substituted.
    pub custom_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// One way of starting a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Open a new console window (Windows).
    pub new_console: bool,
}

impl TerminalInvocation {
    fn new<S: Into<String>>(program: &str, args: impl IntoIterator<Item = S>) -> Self {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            new_console: false,
        }
    }

    fn in_dir(mut self, dir: PathBuf) -> Self {
        self.cwd = Some(dir);
        self
    }

    fn with_new_console(mut self) -> Self {
        self.new_console = true;
        self
    }
}

/// Candidate invocations for a launch, in the order they should be tried.
pub fn plan(
    config: &TerminalConfig,
    launch: &LaunchCommand,
    platform: Platform,
) -> Vec<TerminalInvocation> {
    match platform {
        Platform::Linux => plan_linux(config, launch),
        Platform::MacOs => plan_macos(config, launch),
        Platform::Windows => plan_windows(config, launch),
    }
}

fn plan_linux(
    config: &TerminalConfig,
    launch: &LaunchCommand,
) -> Vec<TerminalInvocation> {
    let full_command = format!("{}; exec $SHELL", launch.posix_display());
    if config.preset == TerminalPreset::Custom && !config.custom_path.is_empty() {
        let args = if config.custom_args.is_empty() {
            vec![
                "-e".to_string(),
                "bash".to_string(),
                "-c".to_string(),
                full_command,
            ]
        } else {
            substitute_args(config, launch, &full_command)
        };
        return vec![TerminalInvocation::new(&config.custom_path, args)];
    }

    let bash = ["bash", "-c", full_command.as_str()];
    let xfce = format!("bash -c {}", shell_words::quote(&full_command));
    vec![
        TerminalInvocation::new("gnome-terminal", ["--"].into_iter().chain(bash)),
        TerminalInvocation::new("konsole", ["-e"].into_iter().chain(bash)),
        TerminalInvocation::new("xfce4-terminal", ["-e", xfce.as_str()]),
        TerminalInvocation::new("alacritty", ["-e"].into_iter().chain(bash)),
        TerminalInvocation::new("kitty", bash),
        TerminalInvocation::new("xterm", ["-e"].into_iter().chain(bash)),
    ]
}

fn plan_macos(
    config: &TerminalConfig,
    launch: &LaunchCommand,
) -> Vec<TerminalInvocation> {
    let line = applescript_escape(&launch.posix_display());
    let script = match config.preset {
        TerminalPreset::ITerm2 => format!(
            "tell application \"iTerm\"\n  activate\n  create window with default profile\n  tell current session of current window\n    write text \"{}\"\n  end tell\nend tell",
            line
        ),
        TerminalPreset::Warp => format!(
            "tell application \"Warp\"\n  activate\nend tell\ndelay 0.5\ntell application \"System Events\"\n  keystroke \"{}\"\n  key code 36\nend tell",
            line
        ),
        TerminalPreset::Custom if !config.custom_path.is_empty() => {
            return vec![TerminalInvocation::new(
                "open",
                ["-a", config.custom_path.as_str()],
            )
            .in_dir(launch.cwd.clone())];
        }
        TerminalPreset::MacTerminal
        | TerminalPreset::WindowsTerminal
        | TerminalPreset::PowerShell
        | TerminalPreset::Cmd
        | TerminalPreset::Custom => format!(
            "tell application \"Terminal\"\n  activate\n  do script \"{}\"\nend tell",
            line
        ),
    };
    vec![TerminalInvocation::new("osascript", ["-e".to_string(), script])]
}

fn plan_windows(
    config: &TerminalConfig,
    launch: &LaunchCommand,
) -> Vec<TerminalInvocation> {
    let dir = launch.cwd.display().to_string();
    let full_command = launch.cmd_display();
    let invocation = match config.preset {
        TerminalPreset::Custom if !config.custom_path.is_empty() => {
            let invocation = if config.custom_args.is_empty() {
                TerminalInvocation::new(&config.custom_path, Vec::<String>::new())
                    .in_dir(launch.cwd.clone())
            } else {
                TerminalInvocation::new(
                    &config.custom_path,
                    substitute_args(config, launch, &full_command),
                )
            };
            invocation.with_new_console()
        }
        TerminalPreset::WindowsTerminal
        | TerminalPreset::MacTerminal
        | TerminalPreset::ITerm2
        | TerminalPreset::Custom => {
            TerminalInvocation::new(
                "wt.exe",
                ["-d", dir.as_str(), "cmd", "/k", full_command.as_str()],
            )
        }
        TerminalPreset::PowerShell => {
            let script = format!("Set-Location '{}'; {}", dir.replace('\'', "''"), launch.command);
            TerminalInvocation::new("powershell.exe", ["-NoExit".to_string(), "-Command".to_string(), script])
                .with_new_console()
        }
        TerminalPreset::Cmd => {
            TerminalInvocation::new("cmd.exe", ["/k", full_command.as_str()]).with_new_console()
        }
        TerminalPreset::Warp => {
            let uri = format!("warp://action/new_window?path={}", url_encode(&dir));
            TerminalInvocation::new("cmd", ["/c".to_string(), "start".to_string(), String::new(), uri])
        }
    };
    vec![invocation]
}

fn substitute_args(config: &TerminalConfig, launch: &LaunchCommand, full_command: &str) -> Vec<String> {
    let dir = launch.cwd.display().to_string();
    config
        .custom_args
        .iter()
        .map(|arg| {
            arg.replace("{command}", &launch.command)
                .replace("{dir}", &dir)
                .replace("{full_command}", full_command)
        })
        .collect()
}

fn applescript_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn url_encode(text: &str) -> String {
    let mut encoded = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Starts the first terminal that can be spawned and forgets it.
///
/// Returns the program that accepted the launch.
pub fn launch_detached(
    config: &TerminalConfig,
    launch: &LaunchCommand,
) -> Result<String, TerminalError> {
    let candidates = plan(config, launch, Platform::current());
    let single = candidates.len() == 1;
    let mut last_error = None;
    for invocation in candidates {
        match spawn_detached(&invocation) {
            Ok(()) => {
                info!(terminal = %invocation.program, cwd = %launch.cwd.display(), "launched external terminal");
                return Ok(invocation.program);
            }
            Err(source) => {
                debug!(terminal = %invocation.program, error = %source, "terminal unavailable");
                last_error = Some((invocation.program, source));
            }
        }
    }
    match last_error {
        Some((terminal, source)) if single => Err(TerminalError::Launch { terminal, source }),
        _ => Err(TerminalError::NoTerminal),
    }
}

fn spawn_detached(invocation: &TerminalInvocation) -> std::io::Result<()> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = &invocation.cwd {
        command.current_dir(dir);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_CONSOLE: u32 = 0x00000010;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        command.creation_flags(if invocation.new_console {
            CREATE_NEW_CONSOLE
        } else {
            CREATE_NO_WINDOW
        });
    }

    let mut child = command.spawn()?;
    // Reaped off-thread so long-lived hosts do not collect zombies.
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn launch() -> LaunchCommand {
        LaunchCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "npm run dev".into()],
            cwd: PathBuf::from("/work/shop"),
            env: BTreeMap::new(),
            overrides: BTreeMap::new(),
            command: "npm run dev".into(),
            mode: None,
            arg_preset: None,
        }
    }

    #[test]
    fn linux_tries_known_terminals_in_order() {
        let plan = plan(&TerminalConfig::default(), &launch(), Platform::Linux);
        let programs: Vec<&str> = plan.iter().map(|i| i.program.as_str()).collect();
        assert_eq!(
            programs,
            vec!["gnome-terminal", "konsole", "xfce4-terminal", "alacritty", "kitty", "xterm"]
        );
        assert_eq!(
            plan[0].args,
            vec!["--", "bash", "-c", "cd /work/shop && npm run dev; exec $SHELL"]
        );
    }

    #[test]
    fn custom_args_are_substituted() {
        let config = TerminalConfig {
            preset: TerminalPreset::Custom,
            custom_path: "/usr/bin/foot".into(),
            custom_args: vec!["--working-directory={dir}".into(), "sh".into(), "-c".into(), "{command}".into()],
        };
        let plan = plan(&config, &launch(), Platform::Linux);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].program, "/usr/bin/foot");
        assert_eq!(
            plan[0].args,
            vec!["--working-directory=/work/shop", "sh", "-c", "npm run dev"]
        );
    }

    #[test]
    fn mac_terminal_script_escapes_quotes() {
        let mut launch = launch();
        launch.command = "echo \"hi\"".into();
        let config = TerminalConfig {
            preset: TerminalPreset::MacTerminal,
            ..TerminalConfig::default()
        };
        let plan = plan(&config, &launch, Platform::MacOs);
        assert_eq!(plan[0].program, "osascript");
        assert!(plan[0].args[1].contains("do script \"cd /work/shop && echo \\\"hi\\\"\""));
    }

    #[test]
    fn custom_preset_without_path_uses_platform_default() {
        let config = TerminalConfig {
            preset: TerminalPreset::Custom,
            ..TerminalConfig::default()
        };
        let windows = plan(&config, &launch(), Platform::Windows);
        assert_eq!(windows[0].program, "wt.exe");
        assert_eq!(windows[0].args[..2], ["-d", "/work/shop"]);

        let mac = plan(&config, &launch(), Platform::MacOs);
        assert_eq!(mac[0].program, "osascript");
        assert!(mac[0].args[1].contains("tell application \"Terminal\""));

        let linux = plan(&config, &launch(), Platform::Linux);
        assert_eq!(linux[0].program, "gnome-terminal");
    }

    #[test]
    fn custom_preset_with_path_opens_that_program() {
        let config = TerminalConfig {
            preset: TerminalPreset::Custom,
            custom_path: "Hyper".into(),
            custom_args: Vec::new(),
        };
        let mac = plan(&config, &launch(), Platform::MacOs);
        assert_eq!(mac[0].program, "open");
        assert_eq!(mac[0].args, vec!["-a", "Hyper"]);
        assert_eq!(mac[0].cwd.as_deref(), Some(std::path::Path::new("/work/shop")));
    }

    #[cfg(unix)]
    #[test]
    fn detached_spawn_is_reaped() {
        let invocation = TerminalInvocation::new("true", Vec::<String>::new());
        spawn_detached(&invocation).unwrap();
        assert!(spawn_detached(&TerminalInvocation::new(
            "/definitely/not/a/terminal",
            Vec::<String>::new()
        ))
        .is_err());
    }

    #[test]
    fn windows_presets() {
        let config = TerminalConfig {
            preset: TerminalPreset::PowerShell,
            ..TerminalConfig::default()
        };
        let plan = plan(&config, &launch(), Platform::Windows);
        assert_eq!(plan[0].program, "powershell.exe");
        assert!(plan[0].new_console);
        assert_eq!(plan[0].args[2], "Set-Location '/work/shop'; npm run dev");
    }

    #[test]
    fn url_encoding_escapes_separators() {
        assert_eq!(url_encode("C:\\my dir"), "C%3A%5Cmy%20dir");
    }
}
