use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flowcheck_core::prelude::{Converged, PollStatus, Poller, RunContext};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::documents::{decode, PlanDocument, TaskDocument};
use crate::error::{ClientError, DecodeError};

pub const SEMSPEC_DIR: &str = ".semspec";

const WORKSPACE_DIRS: [&str; 4] = [
    SEMSPEC_DIR,
    ".semspec/changes",
    ".semspec/specs",
    ".semspec/archive",
];

/// The workspace directory shared with the system under test.
///
/// Paths passed to this client are relative to the workspace root.
#[derive(Debug, Clone)]
pub struct FilesystemClient {
    workspace: PathBuf,
}

impl FilesystemClient {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace
    }

    pub fn semspec_path(&self) -> PathBuf {
        self.workspace.join(SEMSPEC_DIR)
    }

    /// Relative path of the directory the engine keeps a plan in.
    pub fn plan_dir(slug: &str) -> PathBuf {
        Path::new(SEMSPEC_DIR)
            .join("projects")
            .join("default")
            .join("plans")
            .join(slug)
    }

    pub fn plan_file(slug: &str) -> PathBuf {
        Self::plan_dir(slug).join("plan.json")
    }

    pub fn tasks_file(slug: &str) -> PathBuf {
        Self::plan_dir(slug).join("tasks.json")
    }

    fn resolve(&self, relative: &Path) -> PathBuf {
        self.workspace.join(relative)
    }

    /// Start from an empty engine directory.
    pub async fn setup_workspace(&self) -> Result<(), ClientError> {
        self.clean_workspace().await?;

        for dir in WORKSPACE_DIRS {
            let path = self.resolve(Path::new(dir));
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| ClientError::io(format!("creating {}", path.display()), e))?;
        }

        log::debug!("Workspace ready at {}", self.workspace.display());
        Ok(())
    }

    /// Remove everything the engine wrote. A missing directory is already clean.
    pub async fn clean_workspace(&self) -> Result<(), ClientError> {
        let semspec = self.semspec_path();
        match tokio::fs::remove_dir_all(&semspec).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::io(
                format!("removing {}", semspec.display()),
                e,
            )),
        }
    }

    pub async fn write_file(
        &self,
        relative: impl AsRef<Path>,
        contents: impl AsRef<[u8]>,
    ) -> Result<(), ClientError> {
        let path = self.resolve(relative.as_ref());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClientError::io(format!("creating {}", parent.display()), e))?;
        }

        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| ClientError::io(format!("writing {}", path.display()), e))
    }

    pub async fn read_file(&self, relative: impl AsRef<Path>) -> Result<String, ClientError> {
        let path = self.resolve(relative.as_ref());
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ClientError::io(format!("reading {}", path.display()), e))
    }

    pub async fn write_json<T: Serialize>(
        &self,
        relative: impl AsRef<Path>,
        value: &T,
    ) -> Result<(), ClientError> {
        let relative = relative.as_ref();
        let contents = serde_json::to_vec_pretty(value).map_err(|source| {
            DecodeError::new("workspace document", &relative.display().to_string(), source)
        })?;

        self.write_file(relative, contents).await
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        relative: impl AsRef<Path>,
    ) -> Result<T, ClientError> {
        let contents = self.read_file(relative).await?;
        Ok(decode("workspace document", &contents)?)
    }

    pub async fn file_exists(&self, relative: impl AsRef<Path>) -> bool {
        tokio::fs::try_exists(self.resolve(relative.as_ref()))
            .await
            .unwrap_or(false)
    }

    pub async fn read_plan(&self, slug: &str) -> Result<PlanDocument, ClientError> {
        self.read_json(Self::plan_file(slug)).await
    }

    pub async fn write_plan(&self, plan: &PlanDocument) -> Result<(), ClientError> {
        self.write_json(Self::plan_file(&plan.slug), plan).await
    }

    pub async fn read_tasks(&self, slug: &str) -> Result<Vec<TaskDocument>, ClientError> {
        self.read_json(Self::tasks_file(slug)).await
    }

    /// Wait for `relative` to exist, returning its absolute path.
    pub async fn wait_for_path(
        &self,
        ctx: &RunContext,
        relative: impl AsRef<Path>,
        interval: Duration,
    ) -> Result<Converged<PathBuf>, ClientError> {
        let path = self.resolve(relative.as_ref());

        let converged = Poller::new(format!("{}", relative.as_ref().display()))
            .with_interval(interval)
            .poll(ctx, || async {
                Ok::<_, anyhow::Error>(if tokio::fs::try_exists(&path).await? {
                    PollStatus::Ready(path.clone())
                } else {
                    PollStatus::observed("missing")
                })
            })
            .await?;

        Ok(converged)
    }

    /// Wait for the JSON document at `relative` to carry `"status": <status>`.
    ///
    /// A missing file or a document that does not parse yet is treated as not converged, since the
    /// engine may be partway through writing it.
    pub async fn wait_for_status(
        &self,
        ctx: &RunContext,
        relative: impl AsRef<Path>,
        status: &str,
        interval: Duration,
    ) -> Result<Converged<serde_json::Value>, ClientError> {
        let relative = relative.as_ref();

        let converged = Poller::new(format!("{} to reach {status}", relative.display()))
            .with_interval(interval)
            .poll(ctx, || async {
                let document = match self.read_json::<serde_json::Value>(relative).await {
                    Ok(document) => document,
                    Err(ClientError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                        return Ok(PollStatus::observed("missing"));
                    }
                    Err(e) => return Err(e.into()),
                };

                let current = document
                    .get("status")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok::<_, anyhow::Error>(if current == status {
                    PollStatus::Ready(document)
                } else {
                    PollStatus::observed(format!("status: {current}"))
                })
            })
            .await?;

        Ok(converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcheck_core::prelude::ShutdownHandle;
    use serde_json::json;

    #[test]
    fn plan_paths() {
        assert_eq!(
            PathBuf::from(".semspec/projects/default/plans/auth/plan.json"),
            FilesystemClient::plan_file("auth")
        );
        assert_eq!(
            PathBuf::from(".semspec/projects/default/plans/auth/tasks.json"),
            FilesystemClient::tasks_file("auth")
        );
    }

    #[tokio::test]
    async fn setup_replaces_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FilesystemClient::new(dir.path());

        fs.write_file(".semspec/stale.txt", "left over").await.unwrap();
        fs.setup_workspace().await.unwrap();

        assert!(!fs.file_exists(".semspec/stale.txt").await);
        assert!(fs.file_exists(".semspec/changes").await);
        assert!(fs.file_exists(".semspec/archive").await);
    }

    #[tokio::test]
    async fn clean_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FilesystemClient::new(dir.path());

        fs.clean_workspace().await.unwrap();
        fs.setup_workspace().await.unwrap();
        fs.clean_workspace().await.unwrap();

        assert!(!fs.file_exists(SEMSPEC_DIR).await);
    }

    #[tokio::test]
    async fn json_documents_create_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FilesystemClient::new(dir.path());

        let plan = PlanDocument {
            slug: "auth".to_string(),
            title: "Auth".to_string(),
            goal: Some("Add login".to_string()),
            ..Default::default()
        };
        fs.write_plan(&plan).await.unwrap();

        assert_eq!(plan, fs.read_plan("auth").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FilesystemClient::new(dir.path());

        fs.write_file(FilesystemClient::tasks_file("auth"), "[{").await.unwrap();

        assert!(matches!(
            fs.read_tasks("auth").await,
            Err(ClientError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn waits_for_status_written_later() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FilesystemClient::new(dir.path());
        let writer = fs.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .write_json("change.json", &json!({ "status": "drafting" }))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .write_json("change.json", &json!({ "status": "approved" }))
                .await
                .unwrap();
        });

        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(5));
        let converged = fs
            .wait_for_status(&ctx, "change.json", "approved", Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(json!("approved"), converged.value["status"]);
    }

    #[tokio::test]
    async fn wait_for_missing_path_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FilesystemClient::new(dir.path());

        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_millis(100));
        let err = fs
            .wait_for_path(&ctx, "never.json", Duration::from_millis(20))
            .await
            .unwrap_err();

        match err {
            ClientError::Timeout(timeout) => {
                assert_eq!(Some("missing".to_string()), timeout.last_observed)
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
