//! Git operations using the git CLI through the process runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use provision_engine::{Invocation, ProcessRunner};
use tempfile::TempDir;
use tracing::{debug, info};

/// Identity used for every commit the installer makes.
pub const BOT_NAME: &str = "kubefirst-bot";
pub const BOT_EMAIL: &str = "kubefirst-bot@kubefirst.com";

/// Credentials for a push.
#[derive(Clone)]
pub enum PushAuth {
    /// SSH with the bot's private key; host keys are not verified.
    Ssh { private_key: String },
    /// HTTP basic authentication.
    Basic { username: String, password: String },
}

impl std::fmt::Debug for PushAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssh { .. } => f.write_str("Ssh { .. }"),
            Self::Basic { username, .. } => write!(f, "Basic {{ username: {username:?}, .. }}"),
        }
    }
}

/// A working copy driven through the `git` binary.
pub struct GitRepo {
    dir: PathBuf,
    git_bin: PathBuf,
    runner: ProcessRunner,
}

impl GitRepo {
    /// Wrap an existing directory without touching it.
    pub fn open(dir: impl Into<PathBuf>, git_bin: impl Into<PathBuf>, runner: ProcessRunner) -> Self {
        Self {
            dir: dir.into(),
            git_bin: git_bin.into(),
            runner,
        }
    }

    /// Open `dir`, running `git init` first if it is not a repository yet.
    ///
    /// # Errors
    ///
    /// Returns an error if `git init` fails.
    pub async fn open_or_init(
        dir: impl Into<PathBuf>,
        git_bin: impl Into<PathBuf>,
        runner: ProcessRunner,
    ) -> Result<Self> {
        let repo = Self::open(dir, git_bin, runner);
        if !repo.dir.join(".git").exists() {
            info!(dir = %repo.dir.display(), "Initializing git repository");
            repo.runner.run(&repo.git().arg("init")).await?;
        }
        Ok(repo)
    }

    /// Clone `url` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the clone fails.
    pub async fn clone(
        url: &str,
        dir: impl Into<PathBuf>,
        git_bin: impl Into<PathBuf>,
        runner: ProcessRunner,
    ) -> Result<Self> {
        let dir = dir.into();
        let git_bin = git_bin.into();
        debug!(url = %url, dir = %dir.display(), "Cloning repository");

        let invocation = Invocation::new(&git_bin).args(["clone", url]).arg(&dir);
        runner
            .run(&invocation)
            .await
            .with_context(|| format!("Failed to clone {url}"))?;

        Ok(Self::open(dir, git_bin, runner))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn git(&self) -> Invocation {
        Invocation::new(&self.git_bin).current_dir(&self.dir)
    }

    /// Point `name` at `url`, replacing the URL if the remote already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub async fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        let remotes = self.runner.capture(&self.git().arg("remote")).await?;
        let exists = remotes.lines().any(|line| line.trim() == name);

        let action = if exists { "set-url" } else { "add" };
        debug!(remote = %name, url = %url, action, "Configuring remote");
        self.runner
            .run(&self.git().args(["remote", action, name, url]))
            .await?;
        Ok(())
    }

    /// `git add -A`.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub async fn stage_all(&self) -> Result<()> {
        self.runner.run(&self.git().args(["add", "-A"])).await?;
        Ok(())
    }

    /// Commit everything staged as the bot. Returns `false` when there was
    /// nothing to commit.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub async fn commit(&self, message: &str) -> Result<bool> {
        let status = self
            .runner
            .capture(&self.git().args(["status", "--porcelain"]))
            .await?;
        if status.is_empty() {
            info!(dir = %self.dir.display(), "Nothing to commit");
            return Ok(false);
        }

        let invocation = self.git().args(["commit", "-m", message]).envs([
            ("GIT_AUTHOR_NAME", BOT_NAME),
            ("GIT_AUTHOR_EMAIL", BOT_EMAIL),
            ("GIT_COMMITTER_NAME", BOT_NAME),
            ("GIT_COMMITTER_EMAIL", BOT_EMAIL),
        ]);
        self.runner.run(&invocation).await?;
        Ok(true)
    }

    /// Push all branches to `remote`.
    ///
    /// # Errors
    ///
    /// Returns an error if the push fails.
    pub async fn push(&self, remote: &str, auth: &PushAuth) -> Result<()> {
        // Holds the key file for SSH pushes until git exits.
        let mut _key_dir = None;

        let mut invocation = self.git().args(["push", remote, "--all"]);
        match auth {
            PushAuth::Basic { username, password } => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                invocation = invocation.envs([
                    ("GIT_CONFIG_COUNT", "1".to_string()),
                    ("GIT_CONFIG_KEY_0", "http.extraHeader".to_string()),
                    ("GIT_CONFIG_VALUE_0", format!("Authorization: Basic {credentials}")),
                ]);
            }
            PushAuth::Ssh { private_key } => {
                let (dir, key_path) = write_private_key(private_key)?;
                invocation = invocation.env("GIT_SSH_COMMAND", ssh_command(&key_path));
                _key_dir = Some(dir);
            }
        }

        info!(dir = %self.dir.display(), remote = %remote, "Pushing");
        self.runner
            .run(&invocation)
            .await
            .with_context(|| format!("Failed to push {} to {remote}", self.dir.display()))?;
        Ok(())
    }
}

/// `GIT_SSH_COMMAND` value for a key file, with host-key checks disabled.
#[must_use]
pub fn ssh_command(key_path: &Path) -> String {
    format!(
        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
        shell_quote(&key_path.display().to_string())
    )
}

/// Single-quote `value` for `sh`, the way git evaluates `GIT_SSH_COMMAND`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn write_private_key(private_key: &str) -> Result<(TempDir, PathBuf)> {
    let dir = TempDir::new().context("Failed to create key directory")?;
    let path = dir.path().join("id_rsa");
    let mut contents = private_key.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    std::fs::write(&path, contents).context("Failed to write private key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict private key permissions")?;
    }
    Ok((dir, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bare_remote(root: &Path) -> PathBuf {
        let remote = root.join("remote.git");
        ProcessRunner::new()
            .run(&Invocation::new("git").args(["init", "--bare"]).arg(&remote))
            .await
            .unwrap();
        remote
    }

    #[tokio::test]
    async fn test_commit_and_push_to_bare_remote() {
        let root = TempDir::new().unwrap();
        let remote = bare_remote(root.path()).await;
        let work = root.path().join("work");
        std::fs::create_dir(&work).unwrap();
        std::fs::write(work.join("README.md"), "hello\n").unwrap();

        let repo = GitRepo::open_or_init(&work, "git", ProcessRunner::new()).await.unwrap();
        repo.stage_all().await.unwrap();
        assert!(repo.commit("initial").await.unwrap());
        repo.add_remote("gitlab", remote.to_str().unwrap()).await.unwrap();
        repo.push(
            "gitlab",
            &PushAuth::Basic {
                username: "root".into(),
                password: "glpat-1".into(),
            },
        )
        .await
        .unwrap();

        let copy = GitRepo::clone(
            remote.to_str().unwrap(),
            root.path().join("copy"),
            "git",
            ProcessRunner::new(),
        )
        .await
        .unwrap();
        let readme = std::fs::read_to_string(copy.dir().join("README.md")).unwrap();
        assert_eq!(readme, "hello\n");

        let author = ProcessRunner::new()
            .capture(
                &Invocation::new("git")
                    .current_dir(copy.dir())
                    .args(["log", "-1", "--format=%an <%ae>"]),
            )
            .await
            .unwrap();
        assert_eq!(author, format!("{BOT_NAME} <{BOT_EMAIL}>"));
    }

    #[tokio::test]
    async fn test_nothing_to_commit_is_not_an_error() {
        let root = TempDir::new().unwrap();
        let repo = GitRepo::open_or_init(root.path(), "git", ProcessRunner::new())
            .await
            .unwrap();
        repo.stage_all().await.unwrap();
        assert!(!repo.commit("empty").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_remote_twice_updates_url() {
        let root = TempDir::new().unwrap();
        let repo = GitRepo::open_or_init(root.path(), "git", ProcessRunner::new())
            .await
            .unwrap();
        repo.add_remote("soft", "ssh://127.0.0.1:8022/gitops").await.unwrap();
        repo.add_remote("soft", "ssh://127.0.0.1:8022/other").await.unwrap();

        let url = ProcessRunner::new()
            .capture(
                &Invocation::new("git")
                    .current_dir(root.path())
                    .args(["remote", "get-url", "soft"]),
            )
            .await
            .unwrap();
        assert_eq!(url, "ssh://127.0.0.1:8022/other");
    }

    #[test]
    fn test_ssh_command_disables_host_key_checks() {
        let command = ssh_command(Path::new("/tmp/k/id_rsa"));
        assert!(command.starts_with("ssh -i '/tmp/k/id_rsa' "));
        assert!(command.contains("StrictHostKeyChecking=no"));
    }

    #[test]
    fn test_ssh_command_quotes_key_path() {
        let command = ssh_command(Path::new("/tmp/my keys/it's/id_rsa"));
        assert!(command.starts_with(r"ssh -i '/tmp/my keys/it'\''s/id_rsa' -o "));
    }

    #[tokio::test]
    async fn test_ssh_command_path_with_spaces_survives_shell() {
        let root = TempDir::new().unwrap();
        let key_path = root.path().join("key dir").join("id_rsa");
        std::fs::create_dir_all(key_path.parent().unwrap()).unwrap();
        std::fs::write(&key_path, "key\n").unwrap();

        // git runs GIT_SSH_COMMAND through sh; `-i` must arrive as one argument.
        let command = ssh_command(&key_path).replacen("ssh", "printf '%s\\n'", 1);
        let out = ProcessRunner::new()
            .capture(&Invocation::new("sh").args(["-c", &command]))
            .await
            .unwrap();
        let args: Vec<&str> = out.lines().collect();
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], key_path.to_str().unwrap());
    }

    #[test]
    fn test_push_auth_debug_hides_secrets() {
        let auth = PushAuth::Basic {
            username: "root".into(),
            password: "glpat-1".into(),
        };
        assert!(!format!("{auth:?}").contains("glpat-1"));
    }
}
