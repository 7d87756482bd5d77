use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch::{self, Receiver};

use crate::{
    droppable_handle::DroppableHandle,
    error::ServerError,
    users::{User, UserRegistry, parse_auth, read_auth_file},
};

// Listen to changes of a single file, and send updates in a watch channel.
// The parent directory is watched so that editors replacing the file are noticed too.
fn watch_file<W: Watcher>(file: &Path) -> color_eyre::Result<(W, Receiver<()>)> {
    let file_name: OsString = file
        .file_name()
        .ok_or_else(|| ServerError::InvalidConfig(format!("{file:?} is not a file")))?
        .into();
    let directory = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let (tx, rx) = watch::channel(());
    let mut watcher = W::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let is_relevant = event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(file_name.as_os_str()));
                match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        if is_relevant =>
                    {
                        tx.send_replace(());
                    }
                    _ => (),
                }
            };
        },
        notify::Config::default().with_follow_symlinks(true),
    )?;
    watcher.watch(directory.as_path(), RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

// Read the auth file, adding the inline user on top of it.
async fn load_users(path: &Path, inline: Option<&str>) -> Result<Vec<User>, ServerError> {
    let mut users = read_auth_file(path).await?;
    if let Some(inline) = inline {
        let (name, password) = parse_auth(inline);
        if !name.is_empty() {
            users.push(User::allow_all(name, password));
        }
    }
    Ok(users)
}

// Reload the registry from the auth file whenever it changes.
pub(crate) struct AuthFileWatcher {
    // Task that reloads users upon filesystem changes.
    _join_handle: DroppableHandle<()>,
    // Filesystem change watcher.
    _watcher: RecommendedWatcher,
}

impl AuthFileWatcher {
    /// Load the auth file into the registry, then keep it up to date.
    ///
    /// The initial load must succeed; later failures are logged and keep the previous users.
    pub(crate) async fn watch(
        path: PathBuf,
        users: Arc<UserRegistry>,
        inline: Option<String>,
    ) -> color_eyre::Result<Self> {
        users.reset(load_users(&path, inline.as_deref()).await?);
        #[cfg(not(coverage_nightly))]
        tracing::info!(?path, count = users.len(), "Loaded users from auth file.");
        let (watcher, mut rx) = watch_file::<RecommendedWatcher>(&path)?;
        let join_handle = DroppableHandle::spawn(async move {
            loop {
                // Wait and debounce
                loop {
                    if rx.changed().await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let Ok(changed) = rx.has_changed() else {
                        return;
                    };
                    if !changed {
                        break;
                    }
                }
                match load_users(&path, inline.as_deref()).await {
                    Ok(loaded) => {
                        users.reset(loaded);
                        #[cfg(not(coverage_nightly))]
                        tracing::info!(?path, count = users.len(), "Reloaded users from auth file.");
                    }
                    Err(error) => {
                        #[cfg(not(coverage_nightly))]
                        tracing::error!(?path, %error, "Unable to reload auth file, keeping previous users.");
                    }
                }
            }
        });
        Ok(AuthFileWatcher {
            _join_handle: join_handle,
            _watcher: watcher,
        })
    }
}
