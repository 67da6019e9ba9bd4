//! Filesystem handler that materializes the instance identity credential.
//!
//! Each container gets `<cred_dir>/<guid>/` on the host, bind mounted
//! read-only at `container_path`. The directory holds `instance.crt` (leaf
//! followed by CA) and `instance.key`.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handler::CredentialHandler;
use crate::types::{
    BindMount, BindMountMode, Container, Credential, Credentials, EnvironmentVariable,
};

/// Default mount point of the credential directory inside the container.
pub const DEFAULT_CONTAINER_PATH: &str = "/etc/claw/instance-credentials";

/// Certificate chain file name.
pub const CERT_FILE_NAME: &str = "instance.crt";

/// Private key file name.
pub const KEY_FILE_NAME: &str = "instance.key";

/// Environment variable pointing at the certificate inside the container.
pub const CERT_ENV_VAR: &str = "CLAW_INSTANCE_CERT";

/// Environment variable pointing at the private key inside the container.
pub const KEY_ENV_VAR: &str = "CLAW_INSTANCE_KEY";

/// Writes instance identity credentials into per-container host directories.
#[derive(Debug, Clone)]
pub struct InstanceIdentityHandler {
    cred_dir: PathBuf,
    container_path: PathBuf,
}

impl InstanceIdentityHandler {
    /// Creates a handler rooted at `cred_dir` on the host.
    #[must_use]
    pub fn new(cred_dir: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            cred_dir: cred_dir.into(),
            container_path: container_path.into(),
        }
    }

    /// Host directory for one container.
    ///
    /// # Errors
    ///
    /// Returns an error unless `guid` is a single plain path component, so
    /// the directory always sits directly under the credential root.
    pub fn container_dir(&self, guid: &str) -> Result<PathBuf> {
        let mut components = Path::new(guid).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == guid => Ok(self.cred_dir.join(name)),
            _ => Err(Error::Handler(format!("invalid container guid '{guid}'"))),
        }
    }

    fn write_credential(&self, credential: &Credential, container: &Container) -> Result<()> {
        let dir = self.container_dir(&container.guid)?;
        if !dir.is_dir() {
            return Err(Error::Handler(format!(
                "credential directory {} does not exist",
                dir.display()
            )));
        }

        atomic_write(&dir.join(CERT_FILE_NAME), credential.cert.as_bytes(), 0o644)?;
        atomic_write(&dir.join(KEY_FILE_NAME), credential.key.as_bytes(), 0o600)?;
        Ok(())
    }
}

impl CredentialHandler for InstanceIdentityHandler {
    fn create_dir(
        &self,
        container: &Container,
    ) -> Result<(Vec<BindMount>, Vec<EnvironmentVariable>)> {
        let dir = self.container_dir(&container.guid)?;
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "created instance identity directory");

        let mounts = vec![BindMount {
            src_path: dir,
            dst_path: self.container_path.clone(),
            mode: BindMountMode::ReadOnly,
        }];
        let env = vec![
            EnvironmentVariable::new(
                CERT_ENV_VAR,
                self.container_path.join(CERT_FILE_NAME).display().to_string(),
            ),
            EnvironmentVariable::new(
                KEY_ENV_VAR,
                self.container_path.join(KEY_FILE_NAME).display().to_string(),
            ),
        ];
        Ok((mounts, env))
    }

    fn remove_dir(&self, container: &Container) -> Result<()> {
        let dir = self.container_dir(&container.guid)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "removed instance identity directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, credentials: &Credentials, container: &Container) -> Result<()> {
        self.write_credential(&credentials.instance_identity, container)
    }

    fn close(&self, credentials: &Credentials, container: &Container) -> Result<()> {
        self.write_credential(&credentials.instance_identity, container)?;
        info!(guid = %container.guid, "instance identity invalidated");
        Ok(())
    }
}

/// Replaces `path` with `data` through a temporary sibling and a rename.
///
/// The temporary file is created owner-only, so key material is never
/// readable by others. Wider modes are applied before the data is written.
fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Handler(format!("{} has no parent directory", path.display())))?;
    let prefix = format!(
        ".{}.tmp.",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("credential")
    );
    let mut temp = tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?;

    #[cfg(unix)]
    if mode != 0o600 {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn credentials(tag: &str) -> Credentials {
        Credentials {
            instance_identity: Credential::new(format!("{tag}-cert"), format!("{tag}-key")),
            c2c: Credential::new("c2c-cert".into(), "c2c-key".into()),
        }
    }

    fn setup() -> (tempfile::TempDir, InstanceIdentityHandler, Container) {
        let dir = tempfile::tempdir().unwrap();
        let handler = InstanceIdentityHandler::new(dir.path(), DEFAULT_CONTAINER_PATH);
        (dir, handler, Container::new("container-guid"))
    }

    #[test]
    fn create_dir_returns_mount_and_env() {
        let (root, handler, container) = setup();

        let (mounts, env) = handler.create_dir(&container).unwrap();

        assert!(root.path().join("container-guid").is_dir());
        assert_eq!(
            mounts,
            vec![BindMount {
                src_path: root.path().join("container-guid"),
                dst_path: PathBuf::from(DEFAULT_CONTAINER_PATH),
                mode: BindMountMode::ReadOnly,
            }]
        );
        assert_eq!(
            env,
            vec![
                EnvironmentVariable::new(
                    CERT_ENV_VAR,
                    "/etc/claw/instance-credentials/instance.crt"
                ),
                EnvironmentVariable::new(
                    KEY_ENV_VAR,
                    "/etc/claw/instance-credentials/instance.key"
                ),
            ]
        );
    }

    #[test]
    fn update_writes_instance_identity_only() {
        let (root, handler, container) = setup();
        handler.create_dir(&container).unwrap();

        handler.update(&credentials("first"), &container).unwrap();
        handler.update(&credentials("second"), &container).unwrap();

        let dir = root.path().join("container-guid");
        assert_eq!(
            fs::read_to_string(dir.join(CERT_FILE_NAME)).unwrap(),
            "second-cert"
        );
        assert_eq!(
            fs::read_to_string(dir.join(KEY_FILE_NAME)).unwrap(),
            "second-key"
        );
        let leftovers = fs::read_dir(&dir).unwrap().count();
        assert_eq!(leftovers, 2);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (root, handler, container) = setup();
        handler.create_dir(&container).unwrap();
        handler.update(&credentials("first"), &container).unwrap();

        let mode = fs::metadata(root.path().join("container-guid").join(KEY_FILE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn cert_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let (root, handler, container) = setup();
        handler.create_dir(&container).unwrap();
        handler.update(&credentials("first"), &container).unwrap();

        let mode = fs::metadata(root.path().join("container-guid").join(CERT_FILE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[cfg(unix)]
    #[test]
    fn loose_key_file_is_replaced_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (root, handler, container) = setup();
        handler.create_dir(&container).unwrap();
        let key_path = root.path().join("container-guid").join(KEY_FILE_NAME);
        fs::write(&key_path, "old-key").unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o666)).unwrap();

        handler.update(&credentials("fresh"), &container).unwrap();

        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&key_path).unwrap(), "fresh-key");
    }

    #[cfg(unix)]
    #[test]
    fn temp_files_are_created_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let temp = tempfile::Builder::new()
            .prefix(".instance.key.tmp.")
            .tempfile_in(dir.path())
            .unwrap();
        let mode = temp.as_file().metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn close_overwrites_with_invalidated_credential() {
        let (root, handler, container) = setup();
        handler.create_dir(&container).unwrap();
        handler.update(&credentials("live"), &container).unwrap();

        handler.close(&credentials("dead"), &container).unwrap();

        let cert =
            fs::read_to_string(root.path().join("container-guid").join(CERT_FILE_NAME)).unwrap();
        assert_eq!(cert, "dead-cert");
    }

    #[test]
    fn update_without_directory_fails() {
        let (_root, handler, container) = setup();
        let err = handler.update(&credentials("x"), &container).unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
    }

    #[test]
    fn remove_dir_deletes_and_tolerates_missing() {
        let (root, handler, container) = setup();
        handler.create_dir(&container).unwrap();
        handler.update(&credentials("x"), &container).unwrap();

        handler.remove_dir(&container).unwrap();
        assert!(!root.path().join("container-guid").exists());

        handler.remove_dir(&container).unwrap();
    }

    #[test_case("" ; "empty")]
    #[test_case("/etc" ; "absolute")]
    #[test_case(".." ; "parent")]
    #[test_case("." ; "current")]
    #[test_case("a/b" ; "nested")]
    #[test_case("a/" ; "trailing separator")]
    fn unsafe_guids_are_rejected(guid: &str) {
        let (_root, handler, _) = setup();
        let container = Container::new(guid);

        assert!(matches!(handler.container_dir(guid), Err(Error::Handler(_))));
        assert!(matches!(handler.create_dir(&container), Err(Error::Handler(_))));
        assert!(matches!(
            handler.update(&credentials("x"), &container),
            Err(Error::Handler(_))
        ));
        assert!(matches!(handler.remove_dir(&container), Err(Error::Handler(_))));
    }

    #[test]
    fn remove_dir_with_empty_guid_keeps_siblings() {
        let (root, handler, _) = setup();
        let other = root.path().join("other");
        fs::create_dir(&other).unwrap();
        fs::write(other.join(CERT_FILE_NAME), "other-cert").unwrap();

        let err = handler.remove_dir(&Container::new("")).unwrap_err();

        assert!(matches!(err, Error::Handler(_)));
        assert!(other.join(CERT_FILE_NAME).is_file());
        assert!(root.path().is_dir());
    }

    #[test]
    fn container_dir_joins_plain_guid() {
        let (root, handler, _) = setup();
        assert_eq!(
            handler.container_dir("container-guid").unwrap(),
            root.path().join("container-guid")
        );
    }
}
