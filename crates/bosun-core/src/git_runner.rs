//! Abstraction over `git` CLI invocations. The core never links a git
//! library; every operation shells out to the `git` binary and captures
//! stdout/stderr verbatim so callers can feed them to the error classifier.

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Trait boundary so worktree/branch operations can be exercised with a
/// mock in tests instead of a real subprocess.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &str, args: &[&str]) -> Result<GitOutput, String>;
}

/// Shells out to the real `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
