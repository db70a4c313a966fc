//! Where compiler processes run: directly on the host, inside a schroot
//! profile, or inside a running docker container.

use std::process::Stdio;

use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEnvironment {
    Host,
    Schroot { profile: String },
    Docker { container: String },
}

impl ShellEnvironment {
    /// Pick the environment a client asked for. A schroot profile takes
    /// precedence over a docker container.
    pub fn from_request(schroot_profile: Option<&str>, docker_container: Option<&str>) -> Self {
        match (schroot_profile, docker_container) {
            (Some(profile), _) => ShellEnvironment::Schroot {
                profile: profile.to_string(),
            },
            (None, Some(container)) => ShellEnvironment::Docker {
                container: container.to_string(),
            },
            (None, None) => ShellEnvironment::Host,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShellEnvironment::Host => "host",
            ShellEnvironment::Schroot { .. } => "schroot",
            ShellEnvironment::Docker { .. } => "docker",
        }
    }

    /// Build the command running `program args...` in `cwd` inside this
    /// environment. The child is killed if the returned future is dropped.
    pub fn command(&self, program: &str, args: &[String], cwd: Option<&str>) -> Command {
        let mut cmd = match self {
            ShellEnvironment::Host => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                if let Some(cwd) = cwd {
                    cmd.current_dir(cwd);
                }
                cmd
            }
            ShellEnvironment::Schroot { profile } => {
                let mut cmd = Command::new("schroot");
                cmd.args(["-c", profile.as_str()]);
                if let Some(cwd) = cwd {
                    cmd.args(["-d", cwd]);
                }
                cmd.arg("--").arg(program).args(args);
                cmd
            }
            ShellEnvironment::Docker { container } => {
                let mut cmd = Command::new("docker");
                cmd.arg("exec");
                if let Some(cwd) = cwd {
                    cmd.args(["--workdir", cwd]);
                }
                cmd.arg(container).arg(program).args(args);
                cmd
            }
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl std::fmt::Display for ShellEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellEnvironment::Host => write!(f, "host"),
            ShellEnvironment::Schroot { profile } => write!(f, "schroot:{}", profile),
            ShellEnvironment::Docker { container } => write!(f, "docker:{}", container),
        }
    }
}
