use std::path::PathBuf;

use anyhow::{bail, Result};

/// Provides the list of filepaths to try for a config file, in order of
/// preference: an explicit home dir, the cwd, `~/.{hidden}`, the system
/// config dir, `$XDG_CONFIG_HOME/{dir}`, `~/.config/{dir}`, `/etc/{dir}`.
pub fn config_filepaths_to_try(
    home_override: Option<PathBuf>,
    dirname: &str,
    hidden_dirname: &str,
    filename: &str,
) -> Vec<PathBuf> {
    let mut dirs_to_try = Vec::new();

    if let Some(dir) = home_override {
        dirs_to_try.push(dir);
    }

    if let Ok(dir) = std::env::current_dir() {
        dirs_to_try.push(dir);
    }

    if let Some(dir) = dirs::home_dir().map(|dir| dir.join(hidden_dirname)) {
        dirs_to_try.push(dir);
    }

    if let Some(dir) = dirs::config_dir().map(|dir| dir.join(dirname)) {
        dirs_to_try.push(dir);
    }

    if let Some(dir) = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .map(|dir| dir.join(dirname))
    {
        dirs_to_try.push(dir);
    }

    if let Some(dir) = dirs::home_dir().map(|dir| dir.join(".config").join(dirname)) {
        dirs_to_try.push(dir);
    }

    dirs_to_try.push(PathBuf::from("/etc").join(dirname));

    dirs_to_try
        .into_iter()
        .map(|dir| dir.join(filename))
        .collect()
}

/// Builds a tracing env-filter from a list of directive strings.
pub fn tracing_env_filter(directives: &[String]) -> Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(err) => bail!("{}: {}", err, directive),
        }
    }

    Ok(filter)
}
