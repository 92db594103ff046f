// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable consulted when no explicit path is given.
pub const CONFIG_PATH_ENV: &str = "NVMF_TCP_CONFIG";

/// Resolves the config file to load: an explicit `override_path` wins, then
/// [`CONFIG_PATH_ENV`], then `default_rel` relative to the current working
/// directory.
pub fn resolve_config_path(
    override_path: Option<&str>,
    default_rel: &str,
) -> Result<PathBuf> {
    let chosen = override_path
        .map(str::to_owned)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .unwrap_or_else(|| default_rel.to_owned());

    canonicalize_relative_to_cwd(&chosen)
}

fn canonicalize_relative_to_cwd(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins_over_env() {
        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, "/nonexistent/from/env");
        }
        let err = resolve_config_path(Some("/nonexistent/explicit"), "default.yaml")
            .expect_err("neither path exists");
        assert!(err.to_string().contains("nonexistent/explicit"));
        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }
    }
}
