//! Environment diagnostics for `servebench check`

use crate::client::ManagementClient;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

/// Severity of one diagnostic line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Found or reachable
    Ok,
    /// Optional piece missing
    Warn,
    /// Required piece missing or unreachable
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "[OK   ]",
            CheckStatus::Warn => "[WARN ]",
            CheckStatus::Error => "[ERROR]",
        };
        f.write_str(label)
    }
}

/// One diagnostic line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// Severity
    pub status: CheckStatus,
    /// What was found
    pub message: String,
}

impl Check {
    fn new(status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Tools looked up on `PATH`; a missing accelerator tool is only a warning
const TOOLS: &[(&str, CheckStatus, &str)] = &[
    ("torchserve", CheckStatus::Error, "torchserve (server) is not installed"),
    ("torch-model-archiver", CheckStatus::Error, "torch-model-archiver is not installed"),
    ("nvidia-smi", CheckStatus::Warn, "nvidia-smi not found; accelerator memory cannot be tracked"),
];

/// Locate `program` in the directories of `path_var`
pub fn find_on_path(program: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Check the tools on `PATH`
pub fn check_tools(path_var: Option<&OsStr>) -> Vec<Check> {
    TOOLS
        .iter()
        .map(|(program, missing, message)| match find_on_path(program, path_var) {
            Some(found) => Check::new(
                CheckStatus::Ok,
                format!("{} location: {}", program, found.display()),
            ),
            None => Check::new(*missing, *message),
        })
        .collect()
}

/// Check that both APIs of the configured server answer
pub fn check_endpoints(client: &ManagementClient, inference_url: &str, management_url: &str) -> Vec<Check> {
    let probe = |name: &str, url: &str, result: Result<bool, servebench_core::ServiceError>| match result {
        Ok(true) => Check::new(CheckStatus::Ok, format!("{} API reachable at {}", name, url)),
        Ok(false) => Check::new(
            CheckStatus::Error,
            format!("{} API at {} answered with a non-200 status", name, url),
        ),
        Err(e) => Check::new(CheckStatus::Error, format!("{} API at {}: {}", name, url, e)),
    };
    vec![
        probe("inference", inference_url, client.ping()),
        probe("management", management_url, client.management_ok()),
    ]
}

/// Render checks one per line
pub fn format_checks(checks: &[Check]) -> String {
    let mut output = String::new();
    for check in checks {
        output.push_str(&format!("{} {}\n", check.status, check.message));
    }
    output
}

/// Whether any check is an error
pub fn has_errors(checks: &[Check]) -> bool {
    checks.iter().any(|c| c.status == CheckStatus::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_tools_found_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        fake_tool(dir.path(), "torchserve");
        // Not executable, so not found
        std::fs::write(dir.path().join("torch-model-archiver"), "").unwrap();

        let path_var = std::env::join_paths([dir.path()]).unwrap();
        let checks = check_tools(Some(&path_var));
        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0].status, CheckStatus::Ok);
        assert!(checks[0].message.contains("torchserve location"));
        assert_eq!(checks[1].status, CheckStatus::Error);
        assert_eq!(checks[2].status, CheckStatus::Warn);
        assert!(has_errors(&checks));
    }

    #[test]
    fn test_no_path_variable() {
        assert!(find_on_path("torchserve", None).is_none());
        assert!(check_tools(None).iter().all(|c| c.status != CheckStatus::Ok));
    }

    #[test]
    fn test_endpoint_checks() {
        let mut server = mockito::Server::new();
        let _ping = server.mock("GET", "/ping").with_status(200).create();
        let _models = server.mock("GET", "/models").with_status(404).create();
        let client = ManagementClient::new(&server.url(), &server.url(), Duration::from_secs(5)).unwrap();

        let checks = check_endpoints(&client, &server.url(), &server.url());
        assert_eq!(checks[0].status, CheckStatus::Ok);
        assert_eq!(checks[1].status, CheckStatus::Error);

        let text = format_checks(&checks);
        assert!(text.starts_with("[OK   ] inference API reachable"));
        assert!(text.contains("[ERROR] management API"));
    }
}
