use chatvault::cli::{self, Cli, Commands};
use chatvault::error::CoreError;
use chatvault::model::Profile;
use chatvault::pool::DbPool;
use chatvault::{crypto, keys, media, process, queries};
use clap::Parser;
use colored::*;
use log::{error, info};
use std::sync::Arc;

const BANNER: &str = r"
 ██████╗██╗  ██╗ █████╗ ████████╗██╗   ██╗ █████╗ ██╗   ██╗██╗  ████████╗
██╔════╝██║  ██║██╔══██╗╚══██╔══╝██║   ██║██╔══██╗██║   ██║██║  ╚══██╔══╝
██║     ███████║███████║   ██║   ██║   ██║███████║██║   ██║██║     ██║
██║     ██╔══██║██╔══██║   ██║   ╚██╗ ██╔╝██╔══██║██║   ██║██║     ██║
╚██████╗██║  ██║██║  ██║   ██║    ╚████╔╝ ██║  ██║╚██████╔╝███████╗██║
 ╚═════╝╚═╝  ╚═╝╚═╝  ╚═╝   ╚═╝     ╚═══╝  ╚═╝  ╚═╝ ╚═════╝ ╚══════╝╚═╝
";

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    println!("{}", BANNER.cyan());
    println!("{}", format!(" chatvault v{} ", env!("CARGO_PKG_VERSION")).cyan().on_black());

    let result = run(cli.command);

    println!("{}", " done ".cyan().on_black());

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(command: Commands) -> Result<(), CoreError> {
    match command {
        Commands::Key { pid, version, platform, sample_page1 } => {
            info!("running key command");
            let profile = Profile::for_version(version.into());

            let candidates = match pid {
                Some(pid) => {
                    let all = process::enumerate();
                    all.into_iter().filter(|c| c.pid == pid).collect()
                }
                None => process::enumerate(),
            };
            if let Some(p) = platform {
                let p: chatvault::model::Platform = p.into();
                info!("platform override requested: {:?} (informational; candidates are already platform-tagged)", p);
            }
            if candidates.is_empty() {
                return Err(CoreError::KeyNotFound);
            }

            let page1 = sample_page1.map(std::fs::read).transpose()?;

            for candidate in candidates {
                let mut reader = process::open(&candidate)?;
                let cancel = keys::new_cancellation_token();
                let found = match &page1 {
                    Some(bytes) if bytes.len() >= profile.page_size => {
                        let salt: [u8; 16] = bytes[..16].try_into().unwrap();
                        let validator = keys::page1_hmac_validator(salt, bytes.clone(), profile);
                        keys::find_parallel(&mut *reader, validator, &cancel)
                    }
                    _ => keys::find_parallel(&mut *reader, |_| false, &cancel),
                };
                match found {
                    Ok(key) => {
                        println!("pid {}: master_key = {}", candidate.pid, hex::encode(key));
                        return Ok(());
                    }
                    Err(e) => info!("pid {}: {}", candidate.pid, e),
                }
            }
            Err(CoreError::KeyNotFound)
        }

        Commands::Decrypt { data_key, version, db_path, work_dir } => {
            info!("running decrypt command");
            let profile = Profile::for_version(version.into());
            let master_key: [u8; 32] = cli::parse_hex_key(&data_key)?;
            std::fs::create_dir_all(&work_dir)?;

            // A directory of shards keeps batch semantics (§7: per-file
            // errors are logged, the next file is attempted, only
            // cancellation halts the batch) and always exits 0. A single
            // file has exactly one result, so its error — if any —
            // becomes the command's own exit code (§6 scenario 3) rather
            // than being swallowed.
            let single_file = db_path.is_file();

            let cancel = crypto::new_cancellation_token();
            let results = crypto::batch_decrypt(&master_key, profile, &db_path, &work_dir, &cancel);
            let mut first_failure = None;
            for (path, result) in results {
                match result {
                    Ok(out) => println!("{} -> {}", path.display(), out.display()),
                    Err(e) => {
                        println!("{}: {}", path.display(), e);
                        if single_file && first_failure.is_none() && !matches!(e, CoreError::AlreadyDecrypted) {
                            first_failure = Some(e);
                        }
                    }
                }
            }

            match first_failure {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        Commands::Server { data_dir, img_key, addr, online, auto_decrypt, data_key, version } => {
            info!("running server command");
            if auto_decrypt {
                let data_key = data_key.ok_or_else(|| CoreError::InvalidPath("--auto-decrypt requires --data-key".into()))?;
                let master_key: [u8; 32] = cli::parse_hex_key(&data_key)?;
                let profile = Profile::for_version(version.into());
                let cancel = crypto::new_cancellation_token();
                for (path, result) in crypto::batch_decrypt(&master_key, profile, &data_dir, &data_dir, &cancel) {
                    if let Err(e) = result {
                        if !e.recoverable() {
                            error!("{}: {}", path.display(), e);
                        }
                    }
                }
            }

            let pool = Arc::new(DbPool::open(&data_dir)?);
            let watch_cancel = chatvault::pool::watcher::CancellationToken::default();
            let _watcher = chatvault::pool::watcher::spawn(Arc::clone(&pool), watch_cancel)?;

            let mut builder = media::MediaDecoderBuilder::new(&data_dir);
            if let Some(img_key) = img_key {
                let key: [u8; 16] = cli::parse_hex_key(&img_key)?;
                builder = builder.image_key_v2(key);
            }
            let media_decoder = Arc::new(builder.build()?);

            let state = Arc::new(chatvault::api::http::AppState { pool, media: media_decoder });
            chatvault::api::http::start_server(state, online, addr)
        }

        Commands::DbShow { data_dir } => {
            info!("running db-show command");
            let pool = DbPool::open(&data_dir)?;
            for group in chatvault::model::GroupName::all() {
                println!("{:?}: {} handle(s)", group, pool.group_count(group));
            }
            println!("contacts: {}", queries::contacts(&pool)?.len());
            let sessions = queries::sessions(&pool)?;
            println!("sessions: {}", sessions.len());
            for session in sessions.iter().take(5) {
                let last_seen = session
                    .last_timestamp
                    .map(queries::format_timestamp)
                    .unwrap_or_else(|| "-".to_string());
                println!("  {} (last: {})", session.user_name, last_seen);
            }
            Ok(())
        }

        Commands::TableDump { db_path, table } => {
            info!("running table-dump command");
            let conn = rusqlite::Connection::open(&db_path)?;
            let sql = format!("SELECT * FROM {}", table);
            let rows = chatvault::pool::execute_query_json(&conn, &sql, &[])?;
            for row in rows {
                println!("{}", row);
            }
            Ok(())
        }

        Commands::Merge { db_path, out_path } => {
            info!("running merge command [test feature]");
            std::fs::create_dir_all(&out_path)?;
            let merged_path = out_path.join("merged.db");
            let merged = rusqlite::Connection::open(&merged_path)?;

            for path in db_path.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                merged.execute("ATTACH DATABASE ?1 AS src", (path,))?;
                let tables = chatvault::pool::execute_query_json(
                    &merged,
                    "SELECT name FROM src.sqlite_master WHERE type = 'table'",
                    &[],
                )?;
                for row in tables {
                    let Some(name) = row.get("name").and_then(|v| v.as_str()) else { continue };
                    merged.execute(&format!("CREATE TABLE IF NOT EXISTS main.\"{name}\" AS SELECT * FROM src.\"{name}\" WHERE 0"), ())?;
                    merged.execute(&format!("INSERT INTO main.\"{name}\" SELECT * FROM src.\"{name}\""), ())?;
                }
                merged.execute("DETACH DATABASE src", ())?;
            }

            println!("merged database: {}", merged_path.display());
            Ok(())
        }
    }
}
