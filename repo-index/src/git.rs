use async_trait::async_trait;
use codescout_protocol::{RemoteProviderKind, RemoteRepoId, RepoDiscovery, RepoEvent};
use log::warn;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use tokio::sync::broadcast;

const KNOWN_PROVIDERS: [RemoteProviderKind; 2] =
    [RemoteProviderKind::GitHub, RemoteProviderKind::AzureDevOps];

/// Resolve the remote a repository should be searched under.
///
/// Prefers a configured remote on a well-known hosting provider; when the
/// repository has no remotes at all, falls back to inspecting the effective
/// SSH configuration to infer an implicit one.
pub fn resolve_remote(root: &Path) -> Option<RemoteRepoId> {
    let remotes = match list_remote_urls(root) {
        Ok(remotes) => remotes,
        Err(err) => {
            warn!("git remote listing failed for {}: {err:?}", root.display());
            return None;
        }
    };

    if remotes.is_empty() {
        return infer_implicit_remote(root);
    }

    // A remote on a provider the search service understands wins over
    // whatever happens to be listed first.
    remotes
        .iter()
        .find_map(|url| parse_remote_url(url))
        .or_else(|| {
            remotes
                .first()
                .and_then(|url| parse_remote_url_any_host(url))
        })
}

fn list_remote_urls(root: &Path) -> anyhow::Result<Vec<String>> {
    let output = Command::new("git")
        .arg("remote")
        .arg("-v")
        .current_dir(root)
        .output()?;
    if !output.status.success() {
        return Ok(Vec::new());
    }

    let mut urls = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        // "<name>\t<url> (fetch)"
        let mut parts = line.split_whitespace();
        let _name = parts.next();
        let Some(url) = parts.next() else { continue };
        if parts.next() == Some("(fetch)") && !urls.contains(&url.to_string()) {
            urls.push(url.to_string());
        }
    }
    Ok(urls)
}

/// Parse a remote URL when its host belongs to a known provider
fn parse_remote_url(url: &str) -> Option<RemoteRepoId> {
    let (host, path) = split_remote_url(url)?;
    let provider = KNOWN_PROVIDERS
        .iter()
        .copied()
        .find(|provider| host == provider.host())?;
    let (owner, name) = split_owner_name(&path)?;
    Some(RemoteRepoId::new(provider, owner, name))
}

/// Parse a remote URL tolerating unknown hosts, mapping them to GitHub-style
/// owner/name coordinates
fn parse_remote_url_any_host(url: &str) -> Option<RemoteRepoId> {
    let (_host, path) = split_remote_url(url)?;
    let (owner, name) = split_owner_name(&path)?;
    Some(RemoteRepoId::new(RemoteProviderKind::GitHub, owner, name))
}

/// Split a remote URL into host and repository path, handling
/// `git@host:path`, `ssh://git@host/path`, and `https://host/path`
fn split_remote_url(url: &str) -> Option<(String, String)> {
    if let Some(rest) = url.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        return Some((host.to_string(), path.to_string()));
    }

    let rest = url
        .strip_prefix("ssh://")
        .or_else(|| url.strip_prefix("https://"))
        .or_else(|| url.strip_prefix("http://"))?;
    let rest = rest.split_once('@').map(|(_, r)| r).unwrap_or(rest);
    let (host, path) = rest.split_once('/')?;
    Some((host.to_string(), path.to_string()))
}

fn split_owner_name(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_matches('/').trim_end_matches(".git");
    let mut segments = trimmed.rsplitn(2, '/');
    let name = segments.next()?.to_string();
    let owner = segments.next()?.to_string();
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner, name))
}

/// Infer a remote for a repository with none configured by asking ssh for its
/// effective github.com settings; the directory name stands in for the
/// repository name.
fn infer_implicit_remote(root: &Path) -> Option<RemoteRepoId> {
    let output = Command::new("ssh")
        .arg("-G")
        .arg(RemoteProviderKind::GitHub.host())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let mut user = None;
    let mut hostname = None;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Some(value) = line.strip_prefix("user ") {
            user = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("hostname ") {
            hostname = Some(value.trim().to_string());
        }
    }

    let user = user?;
    if hostname.as_deref() != Some(RemoteProviderKind::GitHub.host()) || user == "git" {
        return None;
    }

    let name = root.file_name()?.to_str()?.to_string();
    Some(RemoteRepoId::new(RemoteProviderKind::GitHub, user, name))
}

/// Current HEAD commit, if the repository has one
pub fn head_commit(root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("rev-parse")
        .arg("HEAD")
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if commit.is_empty() { None } else { Some(commit) }
}

/// The upstream tracking ref of the current branch, if configured
pub fn upstream_ref(root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("rev-parse")
        .arg("--abbrev-ref")
        .arg("--symbolic-full-name")
        .arg("@{upstream}")
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let upstream = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if upstream.is_empty() {
        None
    } else {
        Some(upstream)
    }
}

/// Files that differ between `base` and the working tree, including
/// untracked files; paths are workspace-absolute.
pub fn changed_files(root: &Path, base: &str) -> anyhow::Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();

    let output = Command::new("git")
        .arg("diff")
        .arg("--name-only")
        .arg(base)
        .current_dir(root)
        .output()?;
    if !output.status.success() {
        anyhow::bail!(
            "git diff against {base} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            files.insert(root.join(trimmed.replace('\\', "/")));
        }
    }

    let output = Command::new("git")
        .arg("ls-files")
        .arg("--others")
        .arg("--exclude-standard")
        .current_dir(root)
        .output()?;
    if output.status.success() {
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                files.insert(root.join(trimmed.replace('\\', "/")));
            }
        }
    }

    Ok(files)
}

/// Workspace-folder scan that reports directories containing a `.git` entry
pub struct GitRepoDiscovery {
    roots: Vec<PathBuf>,
    events: broadcast::Sender<RepoEvent>,
}

impl GitRepoDiscovery {
    /// Scan the given workspace folders once
    pub fn new(folders: &[PathBuf]) -> Self {
        let mut roots = Vec::new();
        for folder in folders {
            if folder.join(".git").exists() {
                roots.push(folder.clone());
                continue;
            }
            // One level down covers multi-repo workspace folders.
            if let Ok(entries) = std::fs::read_dir(folder) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() && path.join(".git").exists() {
                        roots.push(path);
                    }
                }
            }
        }

        let (events, _) = broadcast::channel(16);
        Self { roots, events }
    }

    /// Report a repository opened after the initial scan
    pub fn notify_opened(&self, root: PathBuf) {
        let _ = self.events.send(RepoEvent::Opened(root));
    }

    /// Report a repository closed after the initial scan
    pub fn notify_closed(&self, root: PathBuf) {
        let _ = self.events.send(RepoEvent::Closed(root));
    }
}

#[async_trait]
impl RepoDiscovery for GitRepoDiscovery {
    async fn settled(&self) {}

    fn repos(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
        self.events.subscribe()
    }
}
