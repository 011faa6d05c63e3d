use crate::backend::{BackendError, CallContext, FileStore};
use crate::error::{GatewayError, Result};
use crate::patterns::SubscriptionType;
use crate::server::router::{handler, CommandContext, CommandRouter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

pub(super) fn register(router: &CommandRouter) {
    router.add_command_handler("readFile", handler(read_file), None);
    router.add_command_handler("readFile64", handler(read_file64), None);
    router.add_command_handler("writeFile", handler(write_file), None);
    router.add_command_handler("writeFile64", handler(write_file64), None);
    router.add_command_handler("createFile", handler(create_file), None);
    router.add_command_handler("readDir", handler(read_dir), None);
    router.add_command_handler("fileExists", handler(file_exists), None);
    router.add_command_handler("mkdir", handler(mkdir), None);
    router.add_command_handler("deleteFile", handler(delete_file), None);
    router.add_command_handler("unlink", handler(delete_folder), None);
    router.add_command_handler("deleteFolder", handler(delete_folder), None);
    router.add_command_handler("renameFile", handler(rename_file), None);
    router.add_command_handler("rename", handler(rename), None);
    router.add_command_handler("readDirAsZip", handler(read_dir_as_zip), None);
    router.add_command_handler("subscribeFiles", handler(subscribe_files), None);
    router.add_command_handler("unsubscribeFiles", handler(unsubscribe_files), None);
}

fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

async fn read_file(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    let file = ctx
        .services
        .backend
        .files
        .read_file(adapter, path, &ctx.conn.call_context())
        .await?;
    let text = String::from_utf8_lossy(&file.data).into_owned();
    Ok(vec![json!(text), json!(file.mime_type)])
}

async fn read_file64(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    let file = ctx
        .services
        .backend
        .files
        .read_file(adapter, path, &ctx.conn.call_context())
        .await?;
    Ok(vec![json!(BASE64.encode(&file.data)), json!(file.mime_type)])
}

async fn write_file(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    let data = match ctx.arg(2) {
        Some(Value::String(s)) => s.clone().into_bytes(),
        Some(other) => other.to_string().into_bytes(),
        None => Vec::new(),
    };
    ctx.services
        .backend
        .files
        .write_file(adapter, path, data, &ctx.conn.call_context())
        .await?;
    Ok(vec![])
}

async fn write_file64(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    let encoded = ctx.opt_str(2).unwrap_or_default();
    let data = BASE64
        .decode(encoded)
        .map_err(|e| GatewayError::validation(format!("writeFile64: {}", e)))?;
    ctx.services
        .backend
        .files
        .write_file(adapter, path, data, &ctx.conn.call_context())
        .await?;
    Ok(vec![])
}

/// Empty file, refused if one already exists
async fn create_file(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    let call = ctx.conn.call_context();
    let files = &ctx.services.backend.files;
    if files.file_exists(adapter, path, &call).await? {
        return Err(GatewayError::validation(format!("{} already exists", path)));
    }
    files.write_file(adapter, path, Vec::new(), &call).await?;
    Ok(vec![])
}

async fn read_dir(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.opt_str(1).unwrap_or_default();
    let entries = ctx
        .services
        .backend
        .files
        .read_dir(adapter, path, &ctx.conn.call_context())
        .await?;
    Ok(vec![json!(entries)])
}

async fn file_exists(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    let exists = ctx
        .services
        .backend
        .files
        .file_exists(adapter, path, &ctx.conn.call_context())
        .await?;
    Ok(vec![json!(exists)])
}

async fn mkdir(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    ctx.services
        .backend
        .files
        .mkdir(adapter, path, &ctx.conn.call_context())
        .await?;
    Ok(vec![])
}

async fn delete_file(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    ctx.services
        .backend
        .files
        .unlink(adapter, path, &ctx.conn.call_context())
        .await?;
    Ok(vec![])
}

/// Remove a file, or a folder with everything below it.
///
/// `NotExists` from `read_dir` means `path` is a plain file.
pub(crate) fn remove_tree<'a>(
    files: &'a dyn FileStore,
    adapter: &'a str,
    path: &'a str,
    ctx: &'a CallContext,
) -> BoxFuture<'a, std::result::Result<(), BackendError>> {
    Box::pin(async move {
        let entries = match files.read_dir(adapter, path, ctx).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_exists() => return files.unlink(adapter, path, ctx).await,
            Err(e) => return Err(e),
        };

        for entry in entries {
            let child = join(path, &entry.file);
            if entry.is_dir {
                remove_tree(files, adapter, &child, ctx).await?;
            } else {
                files.unlink(adapter, &child, ctx).await?;
            }
        }
        // Folders that only existed through their children are gone already
        match files.unlink(adapter, path, ctx).await {
            Err(e) if e.is_not_exists() => Ok(()),
            other => other,
        }
    })
}

async fn delete_folder(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.str_arg(1)?;
    debug!(conn_id = %ctx.conn.id, adapter = adapter, path = path, "Recursive delete");
    remove_tree(ctx.services.backend.files.as_ref(), adapter, path, &ctx.conn.call_context()).await?;
    Ok(vec![])
}

/// Move a file, or a folder with everything below it
pub(crate) fn move_tree<'a>(
    files: &'a dyn FileStore,
    adapter: &'a str,
    from: &'a str,
    to: &'a str,
    ctx: &'a CallContext,
) -> BoxFuture<'a, std::result::Result<(), BackendError>> {
    Box::pin(async move {
        let entries = match files.read_dir(adapter, from, ctx).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_exists() => return files.rename(adapter, from, to, ctx).await,
            Err(e) => return Err(e),
        };

        files.mkdir(adapter, to, ctx).await?;
        for entry in entries {
            let (src, dst) = (join(from, &entry.file), join(to, &entry.file));
            if entry.is_dir {
                move_tree(files, adapter, &src, &dst, ctx).await?;
            } else {
                files.rename(adapter, &src, &dst, ctx).await?;
            }
        }
        match files.unlink(adapter, from, ctx).await {
            Err(e) if e.is_not_exists() => Ok(()),
            other => other,
        }
    })
}

async fn rename_file(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let from = ctx.str_arg(1)?;
    let to = ctx.str_arg(2)?;
    ctx.services
        .backend
        .files
        .rename(adapter, from, to, &ctx.conn.call_context())
        .await?;
    Ok(vec![])
}

async fn rename(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let from = ctx.str_arg(1)?;
    let to = ctx.str_arg(2)?;
    move_tree(ctx.services.backend.files.as_ref(), adapter, from, to, &ctx.conn.call_context()).await?;
    Ok(vec![])
}

/// ZIP of a folder, base64 encoded
async fn read_dir_as_zip(ctx: CommandContext) -> Result<Vec<Value>> {
    let adapter = ctx.str_arg(0)?;
    let path = ctx.opt_str(1).unwrap_or_default();
    let zip = ctx
        .services
        .backend
        .archiver
        .archive_dir(adapter, path, &ctx.conn.call_context())
        .await?;
    Ok(vec![json!(BASE64.encode(zip))])
}

/// `subscribeFiles(id, pattern)` with one file-name pattern or an array
async fn subscribe_files(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let patterns = super::pattern_list(&ctx, 1)?;
    for pattern in patterns {
        ctx.services
            .registry
            .subscribe(Some(ctx.conn.as_ref()), SubscriptionType::FileChange, id, Some(&pattern))
            .await;
    }
    Ok(vec![])
}

async fn unsubscribe_files(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let patterns = super::pattern_list(&ctx, 1)?;
    for pattern in patterns {
        ctx.services
            .registry
            .unsubscribe(Some(ctx.conn.as_ref()), SubscriptionType::FileChange, Some(id), Some(&pattern))
            .await;
    }
    Ok(vec![])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, MemoryBackend};

    fn tree() -> MemoryBackend {
        let mem = MemoryBackend::new();
        mem.insert_file("vis.0", "main/views.json", b"{}");
        mem.insert_file("vis.0", "main/img/a.png", b"png");
        mem.insert_file("vis.0", "main/img/b.png", b"png");
        mem.insert_file("vis.0", "other/x.txt", b"x");
        mem
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("main/", "a"), "main/a");
        assert_eq!(join("main", "a"), "main/a");
    }

    #[tokio::test]
    async fn test_remove_tree_folder() {
        let mem = tree();
        let ctx = CallContext::new("system.user.admin");
        remove_tree(&mem, "vis.0", "main", &ctx).await.unwrap();

        assert!(!mem.has_file("vis.0", "main/views.json"));
        assert!(!mem.has_file("vis.0", "main/img/a.png"));
        assert!(mem.has_file("vis.0", "other/x.txt"));
    }

    #[tokio::test]
    async fn test_remove_tree_leaf_file() {
        let mem = tree();
        let ctx = CallContext::new("system.user.admin");
        remove_tree(&mem, "vis.0", "main/views.json", &ctx).await.unwrap();

        assert!(!mem.has_file("vis.0", "main/views.json"));
        assert!(mem.has_file("vis.0", "main/img/a.png"));
        assert!(mem.calls().contains(&BackendCall::Unlink("vis.0/main/views.json".into())));
    }

    #[tokio::test]
    async fn test_remove_tree_missing_path_propagates() {
        let mem = tree();
        let ctx = CallContext::new("system.user.admin");
        let err = remove_tree(&mem, "vis.0", "nope", &ctx).await.unwrap_err();
        assert!(err.is_not_exists());
    }

    #[tokio::test]
    async fn test_move_tree_folder() {
        let mem = tree();
        let ctx = CallContext::new("system.user.admin");
        move_tree(&mem, "vis.0", "main", "backup", &ctx).await.unwrap();

        assert!(mem.has_file("vis.0", "backup/views.json"));
        assert!(mem.has_file("vis.0", "backup/img/b.png"));
        assert!(!mem.has_file("vis.0", "main/img/b.png"));
    }

    #[tokio::test]
    async fn test_move_tree_leaf_file() {
        let mem = tree();
        let ctx = CallContext::new("system.user.admin");
        move_tree(&mem, "vis.0", "other/x.txt", "other/y.txt", &ctx).await.unwrap();
        assert!(mem.has_file("vis.0", "other/y.txt"));
        assert!(!mem.has_file("vis.0", "other/x.txt"));
    }
}
