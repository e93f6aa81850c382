//! One function per command-line action, each translating flags into
//! repository operations and ending with a publish.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::info;
use tufrepo_core::{
    DelegationRequest, FileLister, Key, KeyGenerator, KeyType, PasswordPrompt, RepoConfig, RepoLayout, Repository,
    RoleName, TopLevelRole,
};

use crate::files::WalkDirLister;
use crate::keygen::FsKeyGenerator;
use crate::prompt::StdinPrompt;
use crate::Cli;

pub struct Session<'a> {
    cli: &'a Cli,
    layout: RepoLayout,
    config: RepoConfig,
    role: RoleName,
    generator: Box<dyn KeyGenerator>,
    lister: Box<dyn FileLister>,
    prompt: Box<dyn PasswordPrompt>,
}

impl<'a> Session<'a> {
    pub fn new(cli: &'a Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => RepoConfig::from_file(path)?,
            None => RepoConfig::default(),
        };
        let role = RoleName::parse(&cli.role)?;
        Ok(Session {
            cli,
            layout: RepoLayout::new(&cli.path),
            generator: Box::new(FsKeyGenerator { kdf: config.kdf }),
            config,
            role,
            lister: Box::new(WalkDirLister),
            prompt: Box::new(StdinPrompt),
        })
    }

    pub fn run(&self) -> Result<()> {
        if self.cli.init {
            self.init()?;
        }
        if self.cli.clean {
            Repository::clean(self.layout.root())?;
            info!(path = %self.layout.root().display(), "repository removed");
        }
        if !self.cli.add.is_empty() {
            self.add()?;
        }
        if !self.cli.remove.is_empty() {
            self.remove()?;
        }
        if self.cli.trust {
            self.trust()?;
        }
        if self.cli.sign.is_some() {
            self.sign()?;
        }
        if let Some(key_type) = &self.cli.key {
            self.generate_key(key_type)?;
        }
        if !self.cli.delegate.is_empty() {
            self.delegate()?;
        }
        if self.cli.revoke {
            self.revoke()?;
        }
        Ok(())
    }

    /// The value of a password flag, prompting when it was given without one.
    fn password(&self, value: &str, prompt: &str) -> Result<String> {
        if !value.is_empty() {
            return Ok(value.to_string());
        }
        Ok(self.prompt.get_password(prompt, false)?)
    }

    fn top_level_password(&self, role: TopLevelRole) -> Result<String> {
        let value = match role {
            TopLevelRole::Root => &self.cli.root_pw,
            TopLevelRole::Targets => &self.cli.targets_pw,
            TopLevelRole::Snapshot => &self.cli.snapshot_pw,
            TopLevelRole::Timestamp => &self.cli.timestamp_pw,
        };
        self.password(value, &format!("Enter a password for the {role} key: "))
    }

    fn open(&self) -> Result<Repository> {
        Repository::load(self.layout.clone(), self.config.clone())
            .with_context(|| format!("cannot load repository at {}", self.layout.root().display()))
    }

    fn load_key_file(&self, repo: &mut Repository, role: &RoleName, path: &Path, password: &str) -> Result<Key> {
        let raw = fs::read(path).with_context(|| format!("cannot read key {}", path.display()))?;
        Ok(repo.import_signing_key(role, &raw, Some(password))?)
    }

    fn load_top_level_key(&self, repo: &mut Repository, role: TopLevelRole) -> Result<Key> {
        let password = self.top_level_password(role)?;
        self.load_key_file(repo, &role.into(), &self.layout.key_path(role), &password)
    }

    /// Key for the role being edited: the keystore key for `targets`, the
    /// `--sign` file for a delegated role.
    fn load_role_key(&self, repo: &mut Repository) -> Result<()> {
        match (&self.role, &self.cli.sign) {
            (RoleName::TopLevel(TopLevelRole::Targets), _) => {
                let password = self.password(&self.cli.pw, "Enter a password for the targets key: ")?;
                let path = self.layout.key_path(TopLevelRole::Targets);
                self.load_key_file(repo, &RoleName::TARGETS, &path, &password)?;
            }
            (RoleName::Delegated(_), Some(path)) if path != Path::new(".") => {
                let password = self.password(&self.cli.pw, &format!("Enter a password for the {} key: ", self.role))?;
                self.load_key_file(repo, &self.role, path, &password)?;
            }
            (RoleName::Delegated(name), _) => bail!("--sign <private key> is required to modify delegated role {name}"),
            (role, _) => bail!("role {role} cannot hold targets or delegations"),
        }
        Ok(())
    }

    /// Re-sign snapshot and timestamp, stage everything dirty and publish.
    fn release(&self, repo: &mut Repository) -> Result<()> {
        self.load_top_level_key(repo, TopLevelRole::Snapshot)?;
        self.load_top_level_key(repo, TopLevelRole::Timestamp)?;
        let consistent = repo.consistent_snapshot()?;
        repo.write_all(consistent)?;
        repo.publish()?;
        for orphan in repo.orphaned_roles() {
            info!(role = %orphan, "role is no longer delegated to and was left out of the release");
        }
        Ok(())
    }

    fn init(&self) -> Result<()> {
        let mut config = self.config.clone();
        config.consistent_snapshot |= self.cli.consistent_snapshot;
        let consistent = config.consistent_snapshot;
        let mut repo = Repository::create(self.layout.clone(), config)?;
        if !self.cli.bare {
            for role in TopLevelRole::ALL {
                let password = self.top_level_password(role)?;
                let generated = self.generator.generate(KeyType::EcdsaNistp256, &password, &self.layout.key_path(role))?;
                repo.add_verification_key(role, &generated.public)?;
                repo.load_signing_key(&role.into(), generated.private)?;
            }
        }
        repo.write_all(consistent)?;
        repo.publish()?;
        let client = repo.create_client_directory()?;
        info!(path = %self.layout.root().display(), client = %client.display(), bare = self.cli.bare, "repository initialized");
        Ok(())
    }

    fn add(&self) -> Result<()> {
        let mut repo = self.open()?;
        let mut added = 0usize;
        for path in &self.cli.add {
            let files = if path.is_dir() { self.lister.list_files(path, self.cli.recursive)? } else { vec![path.clone()] };
            for file in files {
                let target = target_name(&file)?;
                if repo.add_target_file(&self.role, &file, &target, json!({}))? {
                    added += 1;
                }
            }
        }
        self.load_role_key(&mut repo)?;
        self.release(&mut repo)?;
        info!(role = %self.role, added, "targets added");
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut repo = self.open()?;
        let mut removed = 0usize;
        for pattern in &self.cli.remove {
            removed += repo.remove_target_paths(&self.role, pattern)?;
        }
        self.load_role_key(&mut repo)?;
        self.release(&mut repo)?;
        info!(role = %self.role, removed, "targets removed");
        Ok(())
    }

    fn trust(&self) -> Result<()> {
        let Some(top) = self.role.top_level() else {
            bail!("--trust applies to top-level roles, not {}", self.role);
        };
        let mut repo = self.open()?;
        for path in &self.cli.pubkeys {
            let key = read_public_key(path)?;
            repo.add_verification_key(top, &key)?;
            info!(role = %top, keyid = key.keyid(), "key trusted");
        }
        self.load_top_level_key(&mut repo, TopLevelRole::Root)?;
        self.release(&mut repo)
    }

    fn sign(&self) -> Result<()> {
        let mut repo = self.open()?;
        let path = match (&self.cli.sign, self.role.top_level()) {
            (Some(path), _) if path != Path::new(".") => path.clone(),
            (_, Some(top)) => self.layout.key_path(top),
            (_, None) => bail!("--sign needs a private key file for delegated role {}", self.role),
        };
        let password = self.password(&self.cli.pw, &format!("Enter a password for {}: ", path.display()))?;
        let key = self.load_key_file(&mut repo, &self.role, &path, &password)?;
        repo.write(&self.role, false)?;
        if !repo.is_verifiable(&self.role)? {
            info!(role = %self.role, keyid = key.keyid(), "role does not yet meet its signature threshold");
        }
        self.release(&mut repo)
    }

    fn generate_key(&self, key_type: &str) -> Result<()> {
        let key_type = match key_type {
            "ed25519" => KeyType::Ed25519,
            "rsa" => KeyType::Rsa,
            _ => KeyType::EcdsaNistp256,
        };
        let stem = match &self.cli.filename {
            Some(stem) => stem.clone(),
            None => self.layout.keystore_dir().join("key"),
        };
        let password = self.password(&self.cli.pw, "Enter a password for the new key: ")?;
        let generated = self.generator.generate(key_type, &password, &stem)?;
        for path in &generated.written {
            info!(path = %path.display(), "written");
        }
        Ok(())
    }

    fn delegate(&self) -> Result<()> {
        let Some(delegatee) = &self.cli.delegatee else { bail!("--delegatee is required") };
        let mut repo = self.open()?;
        let keys = self.cli.pubkeys.iter().map(|p| read_public_key(p)).collect::<Result<Vec<_>>>()?;
        let request = DelegationRequest::new(delegatee.clone(), keys, self.cli.delegate.clone())
            .threshold(self.cli.threshold)
            .terminating(self.cli.terminating);
        repo.delegate(&self.role, request)?;
        self.load_role_key(&mut repo)?;
        self.release(&mut repo)?;
        info!(parent = %self.role, %delegatee, "delegated");
        Ok(())
    }

    fn revoke(&self) -> Result<()> {
        let Some(delegatee) = &self.cli.delegatee else { bail!("--delegatee is required") };
        let mut repo = self.open()?;
        repo.revoke(&self.role, delegatee)?;
        self.load_role_key(&mut repo)?;
        self.release(&mut repo)?;
        info!(parent = %self.role, %delegatee, "revoked");
        Ok(())
    }
}

fn read_public_key(path: &Path) -> Result<Key> {
    let raw = fs::read(path).with_context(|| format!("cannot read public key {}", path.display()))?;
    Key::from_metadata_json(&raw).with_context(|| format!("invalid public key {}", path.display()))
}

/// Target path recorded for a file: its relative path with `/` separators,
/// or just the file name when given an absolute path.
fn target_name(file: &Path) -> Result<String> {
    let relative: PathBuf = if file.is_absolute() {
        file.file_name().map(PathBuf::from).unwrap_or_default()
    } else {
        file.components().filter(|c| matches!(c, Component::Normal(_))).collect()
    };
    let parts: Vec<_> = relative.iter().map(|p| p.to_string_lossy()).collect();
    if parts.is_empty() {
        bail!("cannot derive a target path from {}", file.display());
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_names_are_relative_and_slash_separated() {
        assert_eq!(target_name(Path::new("./dist/a.txt")).unwrap(), "dist/a.txt");
        assert_eq!(target_name(Path::new("/tmp/build/b.bin")).unwrap(), "b.bin");
        assert!(target_name(Path::new("..")).is_err());
    }
}
