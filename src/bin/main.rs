//
// The carillon server binary.
//
// Exit codes: 0 on success, 1 for configuration errors, 2 when
// --verify-storage finds problems.
//
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};
use log::{error, info};

use carillon::config::Config;

const DEFAULT_CONFIG_PATHS: &str = "?/etc/carillon/config.toml";

// every `[section] key` that may be overridden as `--<section>-<key>`.
const CONFIG_KEYS: &[(&str, &str)] = &[
    ("server", "hosts"),
    ("server", "max_connections"),
    ("server", "max_content_length"),
    ("server", "timeout"),
    ("server", "ssl"),
    ("server", "certificate"),
    ("server", "key"),
    ("server", "certificate_authority"),
    ("server", "protocol"),
    ("server", "ciphersuite"),
    ("encoding", "request"),
    ("encoding", "stock"),
    ("auth", "type"),
    ("auth", "htpasswd_filename"),
    ("auth", "htpasswd_encryption"),
    ("auth", "delay"),
    ("auth", "realm"),
    ("auth", "lc_username"),
    ("auth", "uc_username"),
    ("auth", "strip_domain"),
    ("auth", "urldecode_username"),
    ("auth", "cache_logins"),
    ("auth", "cache_successful_logins_expiry"),
    ("auth", "cache_failed_logins_expiry"),
    ("rights", "type"),
    ("rights", "file"),
    ("rights", "permit_delete_collection"),
    ("rights", "permit_overwrite_collection"),
    ("storage", "type"),
    ("storage", "filesystem_folder"),
    ("storage", "filesystem_fsync"),
    ("storage", "filesystem_cache_folder"),
    ("storage", "use_cache_subfolder_for_item"),
    ("storage", "use_cache_subfolder_for_history"),
    ("storage", "use_cache_subfolder_for_synctoken"),
    ("storage", "use_mtime_and_size_for_item_cache"),
    ("storage", "folder_umask"),
    ("storage", "max_sync_token_age"),
    ("storage", "hook"),
    ("reporting", "max_occurrences"),
    ("reporting", "max_freebusy_occurrences"),
    ("logging", "level"),
    ("logging", "mask_passwords"),
    ("logging", "request_header_on_debug"),
    ("logging", "request_content_on_debug"),
    ("logging", "response_content_on_debug"),
    ("logging", "storage_cache_actions_on_debug"),
    ("logging", "backtrace_on_debug"),
];

fn cli() -> Command {
    let mut cmd = Command::new("carillon")
        .about("CalDAV/CardDAV server with a file-per-item storage backend")
        .arg(
            Arg::new("config")
                .long("config")
                .short('C')
                .value_name("PATHS")
                .help("configuration files, separated by ':' ('?' prefix marks optional)"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .short('D')
                .action(ArgAction::SetTrue)
                .help("print debug information"),
        )
        .arg(
            Arg::new("verify-storage")
                .long("verify-storage")
                .action(ArgAction::SetTrue)
                .help("check the storage for errors and exit"),
        )
        .arg(
            Arg::new("export-storage")
                .long("export-storage")
                .value_name("DIR")
                .help("dump all collections into DIR and exit"),
        );
    for (section, key) in CONFIG_KEYS {
        let id = format!("{}-{}", section, key.replace('_', "-"));
        cmd = cmd.arg(
            Arg::new(id.clone())
                .long(id)
                .value_name("VALUE")
                .hide(true)
                .help(format!("override [{section}] {key}")),
        );
    }
    cmd
}

fn main() -> ExitCode {
    let matches = cli().get_matches();

    let mut overrides: Vec<(String, String, String)> = Vec::new();
    for (section, key) in CONFIG_KEYS {
        let id = format!("{}-{}", section, key.replace('_', "-"));
        if let Some(value) = matches.get_one::<String>(&id) {
            overrides.push((section.to_string(), key.to_string(), value.clone()));
        }
    }
    if matches.get_flag("debug") {
        overrides.push(("logging".to_string(), "level".to_string(), "debug".to_string()));
    }
    let verify = matches.get_flag("verify-storage");
    let export = matches.get_one::<String>("export-storage").cloned();
    if verify || export.is_some() {
        // checks and exports run without fsync to speed things up.
        overrides.push((
            "storage".to_string(),
            "filesystem_fsync".to_string(),
            "false".to_string(),
        ));
    }

    let paths = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_CONFIG_PATHS);
    let config = match Config::load(paths, &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(config.log_level())
        .init();

    if verify {
        return run_verify(&config);
    }
    if let Some(dir) = export {
        return run_export(&config, &dir);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {}", e);
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(carillon::server::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(1),
    }
}

fn run_verify(config: &Config) -> ExitCode {
    let storage = match carillon::storage::create(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("storage error: {e}");
            return ExitCode::from(1);
        }
    };
    match storage.verify() {
        Ok(issues) if issues.is_empty() => {
            info!("storage verification passed");
            ExitCode::SUCCESS
        }
        Ok(issues) => {
            for issue in &issues {
                eprintln!("storage problem: {issue}");
            }
            eprintln!("storage verification failed ({} problems)", issues.len());
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("storage verification failed: {e}");
            ExitCode::from(2)
        }
    }
}

fn run_export(config: &Config, dir: &str) -> ExitCode {
    let storage = match carillon::storage::create(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("storage error: {e}");
            return ExitCode::from(1);
        }
    };
    match storage.export(std::path::Path::new(dir)) {
        Ok(()) => {
            info!("storage exported to {}", dir);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("export failed: {e}");
            ExitCode::from(1)
        }
    }
}
