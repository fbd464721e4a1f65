use std::path::{Path, PathBuf};

use anyhow::Context;
use tgvault_engine::pipeline::{Direction, PipelineError};
use tgvault_engine::sync::{SyncEngine, SyncEvent};
use tgvault_engine::{
    FileRecord, NamePolicy, ResumeOutcome, TransferProgress, Vault, VaultConfig,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::args::{Command, ResumeAction, SyncAction, TagAction, USAGE};

pub async fn run(command: Command, config: &VaultConfig) -> anyhow::Result<()> {
    match command {
        Command::Help => {
            print!("{USAGE}");
            Ok(())
        }
        Command::Init { bot_token, chat_id } => {
            let password = password(config)?;
            let local = Vault::init(config, &bot_token, &chat_id, &password)
                .await
                .context("failed to initialise vault")?;
            println!(
                "linked chat {} (config at {})",
                local.chat_id,
                config.config_path().display()
            );
            Ok(())
        }
        Command::Unmount { mountpoint } => {
            tgvault_fuse::unmount(&mountpoint)
                .with_context(|| format!("failed to unmount {}", mountpoint.display()))?;
            println!("unmounted {}", mountpoint.display());
            Ok(())
        }
        other => {
            let vault = open_vault(config).await?;
            let result = dispatch(&vault, other).await;
            vault.close().await;
            result
        }
    }
}

fn password(config: &VaultConfig) -> anyhow::Result<String> {
    config
        .password
        .clone()
        .context("TGVAULT_PASSWORD is not set")
}

async fn open_vault(config: &VaultConfig) -> anyhow::Result<Vault> {
    let password = password(config)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let vault = Vault::open(config, &password)
        .await
        .context("failed to open vault")?
        .with_progress(tx);
    tokio::spawn(log_progress(rx));
    Ok(vault)
}

async fn log_progress(mut rx: mpsc::UnboundedReceiver<TransferProgress>) {
    while let Some(progress) = rx.recv().await {
        let verb = match progress.direction {
            Direction::Upload => "sent",
            Direction::Download => "fetched",
        };
        info!(
            name = %progress.name,
            chunk = progress.chunk,
            total = progress.total_chunks,
            bytes = progress.bytes_done,
            "{verb} chunk"
        );
    }
}

async fn dispatch(vault: &Vault, command: Command) -> anyhow::Result<()> {
    let pipeline = vault.pipeline();
    let index = vault.index();
    match command {
        Command::Push {
            path,
            name,
            replace,
        } => {
            let policy = if replace {
                NamePolicy::Replace
            } else {
                NamePolicy::Reject
            };
            match pipeline.upload_path(&path, name.as_deref(), policy).await {
                Ok(file) => println!(
                    "stored {} ({}, {} chunk(s){})",
                    file.filename,
                    format_size(file.original_size),
                    file.chunk_count,
                    if file.compressed { ", compressed" } else { "" }
                ),
                Err(PipelineError::Duplicate { existing, .. }) => {
                    println!("already stored as {existing}");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to push {}", path.display()));
                }
            }
        }
        Command::Pull { key, dest } => {
            let file = pipeline.resolve(&key).await?;
            let dest = dest.unwrap_or_else(|| default_destination(&file));
            let bytes = pipeline
                .download_to_path(&file, &dest)
                .await
                .with_context(|| format!("failed to pull {}", file.filename))?;
            println!("wrote {} ({})", dest.display(), format_size(bytes as i64));
        }
        Command::List => print_files(&index.list_files().await?),
        Command::Search { query } => print_files(&index.search_files(&query).await?),
        Command::Delete { key } => {
            let file = pipeline.resolve(&key).await?;
            let report = pipeline.delete_file(&file).await?;
            println!(
                "deleted {} ({} chunk(s) removed, {} already gone, {} failed)",
                file.filename, report.deleted, report.missing, report.failed
            );
        }
        Command::Rename { key, new_name } => {
            let file = pipeline.resolve(&key).await?;
            pipeline.rename_file(&file, &new_name).await?;
            println!("renamed {} -> {new_name}", file.filename);
        }
        Command::Status => {
            let stats = index.stats().await?;
            let config = vault.config();
            println!("chat:          {}", vault.local().chat_id);
            println!("linked since:  {}", vault.local().created_at);
            println!("config:        {}", config.config_path().display());
            println!("index:         {}", config.index_path().display());
            println!("files:         {}", stats.files);
            println!("chunks:        {}", stats.chunks);
            println!("original size: {}", format_size(stats.original_bytes));
            println!("stored size:   {}", format_size(stats.stored_bytes));
            println!("pending:       {}", stats.pending_uploads);
            println!("sync folders:  {}", stats.sync_folders);
            println!("tags:          {}", stats.tags);
        }
        Command::Resume(action) => resume(vault, action).await?,
        Command::Mount { mountpoint } => mount(vault, &mountpoint).await?,
        Command::Tag(action) => tag(vault, action).await?,
        Command::Sync(action) => sync(vault, action).await?,
        Command::Verify { key } => verify(vault, key).await?,
        Command::Help | Command::Init { .. } | Command::Unmount { .. } => {
            unreachable!("handled before the vault is opened")
        }
    }
    Ok(())
}

async fn resume(vault: &Vault, action: ResumeAction) -> anyhow::Result<()> {
    let manager = vault.resume_manager();
    match action {
        ResumeAction::List => {
            let pending = manager.list_pending().await?;
            if pending.is_empty() {
                println!("no interrupted uploads");
            }
            for entry in pending {
                println!(
                    "{:>4}  {}/{}  {}  {}",
                    entry.id,
                    entry.uploaded_chunks,
                    entry.total_chunks,
                    format_size(entry.original_size),
                    entry.filename
                );
            }
        }
        ResumeAction::Clear(id) => {
            anyhow::ensure!(manager.clear(id).await?, "no pending upload with id {id}");
            println!("cleared pending upload {id}");
        }
        ResumeAction::All => {
            let results = manager.resume_all().await?;
            if results.is_empty() {
                println!("nothing to resume");
            }
            let mut failed = 0;
            for (entry, outcome) in results {
                match outcome {
                    Ok(ResumeOutcome::Completed(file)) => {
                        println!("completed {} ({} chunk(s))", file.filename, file.chunk_count)
                    }
                    Ok(ResumeOutcome::AlreadyStored(file)) => {
                        println!("{} was already stored as {}", entry.filename, file.filename)
                    }
                    Ok(ResumeOutcome::Incomplete {
                        id,
                        uploaded,
                        total,
                        missing_spill,
                    }) => {
                        failed += 1;
                        println!("{} still incomplete ({uploaded}/{total})", entry.filename);
                        if !missing_spill.is_empty() {
                            println!(
                                "  {} chunk(s) lost their local copy; run `tgvault resume --clear {id}` and push the file again",
                                missing_spill.len()
                            );
                        }
                    }
                    Err(err) => {
                        failed += 1;
                        println!("{} failed: {err}", entry.filename);
                    }
                }
            }
            anyhow::ensure!(failed == 0, "{failed} upload(s) could not be completed");
        }
    }
    Ok(())
}

#[cfg(feature = "fuse-mount")]
async fn mount(vault: &Vault, mountpoint: &Path) -> anyhow::Result<()> {
    let config = vault.config();
    let fs = tgvault_fuse::VaultFs::new(
        vault.pipeline().clone(),
        config.cache_ttl,
        config.cache_max_bytes,
    );
    tgvault_fuse::mount::mount_until_ctrl_c(fs, mountpoint)
        .await
        .with_context(|| format!("failed to mount at {}", mountpoint.display()))
}

#[cfg(not(feature = "fuse-mount"))]
async fn mount(_vault: &Vault, mountpoint: &Path) -> anyhow::Result<()> {
    anyhow::bail!(
        "cannot mount {}: tgvault was built without the fuse-mount feature",
        mountpoint.display()
    )
}

async fn tag(vault: &Vault, action: TagAction) -> anyhow::Result<()> {
    let index = vault.index();
    let key = match &action {
        TagAction::Add { key, .. } | TagAction::Remove { key, .. } | TagAction::List { key } => {
            key.clone()
        }
    };
    let file = vault.pipeline().resolve(&key).await?;
    match action {
        TagAction::Add { tags, .. } => {
            let added = index.add_tags(file.id, tags.as_slice()).await?;
            debug!(name = %file.filename, added, "tags added");
        }
        TagAction::Remove { tags, .. } => {
            let removed = index.remove_tags(file.id, tags.as_slice()).await?;
            debug!(name = %file.filename, removed, "tags removed");
        }
        TagAction::List { .. } => {}
    }
    let tags = index.list_tags(file.id).await?;
    println!("{}: {}", file.filename, tags.join(", "));
    Ok(())
}

async fn sync(vault: &Vault, action: SyncAction) -> anyhow::Result<()> {
    let engine = vault.sync_engine();
    match action {
        SyncAction::Add(dir) => {
            let folder = engine.add_folder(&dir).await?;
            println!("syncing {}", folder.path);
        }
        SyncAction::Remove(dir) => {
            anyhow::ensure!(
                engine.remove_folder(&dir).await?,
                "{} is not a sync folder",
                dir.display()
            );
            println!("stopped syncing {}", dir.display());
        }
        SyncAction::Enable(dir) => set_enabled(&engine, &dir, true).await?,
        SyncAction::Disable(dir) => set_enabled(&engine, &dir, false).await?,
        SyncAction::List => {
            for folder in engine.list_folders().await? {
                let state = if folder.enabled { "enabled" } else { "disabled" };
                println!("{state:<9} {}", folder.path);
            }
        }
        SyncAction::Run => {
            for (folder, report) in engine.scan_all().await? {
                println!(
                    "{}: {} scanned, {} uploaded, {} already stored, {} unchanged, {} failed",
                    folder.path,
                    report.scanned,
                    report.uploaded,
                    report.already_stored,
                    report.unchanged,
                    report.failed
                );
            }
        }
        SyncAction::Watch => {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(log_sync_events(rx));
            engine
                .with_events(tx)
                .watch(async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "cannot listen for ctrl-c");
                    }
                })
                .await?;
        }
    }
    Ok(())
}

async fn set_enabled(engine: &SyncEngine, dir: &Path, enable: bool) -> anyhow::Result<()> {
    anyhow::ensure!(
        engine.set_folder_enabled(dir, enable).await?,
        "{} is not a sync folder",
        dir.display()
    );
    let state = if enable { "enabled" } else { "disabled" };
    println!("{state} {}", dir.display());
    Ok(())
}

async fn log_sync_events(mut rx: mpsc::UnboundedReceiver<SyncEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::Evaluated {
                relative_path,
                outcome,
                ..
            } => debug!(path = %relative_path, ?outcome, "sync evaluated"),
            SyncEvent::Failed { path, error, .. } => {
                warn!(path = %path.display(), %error, "sync failed")
            }
        }
    }
}

async fn verify(vault: &Vault, key: Option<String>) -> anyhow::Result<()> {
    let pipeline = vault.pipeline();
    let results = match key {
        Some(key) => {
            let file = pipeline.resolve(&key).await?;
            let result = pipeline.verify_file(&file).await;
            vec![(file, result)]
        }
        None => pipeline.verify_all().await?,
    };
    let mut failed = 0;
    for (file, result) in &results {
        match result {
            Ok(()) => println!("ok      {}", file.filename),
            Err(err) => {
                failed += 1;
                println!("FAILED  {}: {err}", file.filename);
            }
        }
    }
    anyhow::ensure!(failed == 0, "{failed} of {} file(s) failed verification", results.len());
    Ok(())
}

fn print_files(files: &[FileRecord]) {
    if files.is_empty() {
        println!("no files");
        return;
    }
    for file in files {
        println!(
            "{:>10}  {:>3}  {}  {}",
            format_size(file.original_size),
            file.chunk_count,
            &file.content_hash[..file.content_hash.len().min(12)],
            file.filename
        );
    }
}

fn default_destination(file: &FileRecord) -> PathBuf {
    Path::new(&file.filename)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&file.filename))
}

fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
