//! Iterative recursive-delete of a directory's contents.
//!
//! Depth-first over an explicit stack of frames, one per directory on the
//! current path, so the call stack stays flat however deep the tree is.
//! Each directory is listed exactly once. The server's working directory
//! follows the traversal with relative `CWD name` / `CWD ..` moves; the
//! absolute navigator is only used to enter the target and as a fallback.

use crate::ftp::client::TransferClient;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::navigator;
use crate::ftp::session::require_completion;
use crate::ftp::types::{render_path, FtpFile};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Work done by one clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearStats {
    pub directories_listed: usize,
    pub files_deleted: usize,
    pub directories_removed: usize,
}

/// A directory below the clear target, linked to its parent. The target
/// itself has no parent and no name.
struct FramePath {
    parent: Option<Arc<FramePath>>,
    name: String,
}

impl FramePath {
    fn target() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            name: String::new(),
        })
    }

    fn child(parent: &Arc<FramePath>, name: &str) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            name: name.to_string(),
        })
    }

    /// Full segment list from the root. Only built for diagnostics and
    /// the absolute fallback.
    fn segments(&self, target: &[String]) -> Vec<String> {
        let mut names = Vec::new();
        let mut node = Some(self);
        while let Some(n) = node {
            if n.parent.is_some() {
                names.push(n.name.clone());
            }
            node = n.parent.as_deref();
        }
        names.reverse();
        let mut out = target.to_vec();
        out.extend(names);
        out
    }
}

impl Drop for FramePath {
    // Unlink iteratively; a chain thousands of levels deep would
    // otherwise be freed by recursion.
    fn drop(&mut self) {
        let mut next = self.parent.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut inner) => next = inner.parent.take(),
                Err(_) => break,
            }
        }
    }
}

struct ClearFrame {
    path: Arc<FramePath>,
    remaining: VecDeque<FtpFile>,
}

struct DirectoryClearer<'a> {
    client: &'a mut dyn TransferClient,
    target: &'a [String],
    /// Directory the server is known to be in.
    cwd: Option<Arc<FramePath>>,
    stats: ClearStats,
}

/// Delete everything below `target`, keeping `target` itself.
pub(crate) async fn clear_directory(client: &mut dyn TransferClient, target: &[String]) -> FtpResult<ClearStats> {
    let mut clearer = DirectoryClearer {
        client,
        target,
        cwd: None,
        stats: ClearStats::default(),
    };
    clearer.run().await
}

impl<'a> DirectoryClearer<'a> {
    async fn run(&mut self) -> FtpResult<ClearStats> {
        let root = FramePath::target();
        navigator::enter_directory(self.client, self.target).await?;
        require_completion(self.client)?;
        self.cwd = Some(Arc::clone(&root));

        let files = self.client.list(None).await?;
        require_completion(self.client)?;
        self.stats.directories_listed += 1;
        if files.is_empty() {
            return Ok(self.stats);
        }

        let mut stack = vec![ClearFrame {
            path: root,
            remaining: files.into(),
        }];
        while let Some(frame) = stack.pop() {
            self.clear_single_frame(frame, &mut stack).await?;
        }
        log::debug!(
            "cleared {}: {} files, {} directories",
            render_path(self.target, None),
            self.stats.files_deleted,
            self.stats.directories_removed
        );
        Ok(self.stats)
    }

    /// Work through one frame until it is drained or a non-empty
    /// subdirectory has to be descended into first.
    async fn clear_single_frame(&mut self, mut frame: ClearFrame, stack: &mut Vec<ClearFrame>) -> FtpResult<()> {
        self.position(&frame.path).await?;

        while let Some(file) = frame.remaining.pop_front() {
            if file.is_directory() {
                let children = self.client.list(Some(&file.name)).await?;
                require_completion(self.client)?;
                self.stats.directories_listed += 1;

                if children.is_empty() {
                    if !self.client.remove_directory(&file.name).await? {
                        return Err(self.delete_error(&frame.path, Some(&file.name)));
                    }
                    self.stats.directories_removed += 1;
                    continue;
                }

                let child = FramePath::child(&frame.path, &file.name);
                stack.push(frame);
                stack.push(ClearFrame {
                    path: child,
                    remaining: children.into(),
                });
                return Ok(());
            }

            if !self.client.delete(&file.name).await? {
                return Err(self.delete_error(&frame.path, Some(&file.name)));
            }
            require_completion(self.client)?;
            self.stats.files_deleted += 1;
        }

        // Drained: remove the frame's directory unless it is the target.
        let Some(parent) = frame.path.parent.clone() else {
            return Ok(());
        };
        self.position_parent_of(&frame.path, &parent).await?;
        if !self.client.remove_directory(&frame.path.name).await? {
            return Err(self.delete_error(&frame.path, None));
        }
        require_completion(self.client)?;
        self.stats.directories_removed += 1;
        Ok(())
    }

    /// Make `path` the server's working directory.
    async fn position(&mut self, path: &Arc<FramePath>) -> FtpResult<()> {
        if self.is_cwd(path) {
            return Ok(());
        }
        let relative = match (&path.parent, &self.cwd) {
            (Some(parent), Some(cwd)) => Arc::ptr_eq(parent, cwd),
            _ => false,
        };
        if relative {
            self.client.change_working_directory(&path.name).await?;
        } else {
            navigator::enter_directory(self.client, &path.segments(self.target)).await?;
        }
        require_completion(self.client)?;
        self.cwd = Some(Arc::clone(path));
        Ok(())
    }

    async fn position_parent_of(&mut self, path: &Arc<FramePath>, parent: &Arc<FramePath>) -> FtpResult<()> {
        if self.is_cwd(path) {
            self.client.change_working_directory("..").await?;
            require_completion(self.client)?;
            self.cwd = Some(Arc::clone(parent));
            Ok(())
        } else {
            self.position(parent).await
        }
    }

    fn is_cwd(&self, path: &Arc<FramePath>) -> bool {
        self.cwd.as_ref().map(|c| Arc::ptr_eq(c, path)).unwrap_or(false)
    }

    fn delete_error(&self, dir: &FramePath, name: Option<&str>) -> FtpError {
        let segments = dir.segments(self.target);
        FtpError::file_delete(render_path(&segments, name)).with_code(self.client.reply_code())
    }
}
