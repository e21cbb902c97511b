use anyhow::Context;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

const APP_DIR: &str = "chatbridge";

/// Config directory: `$CHATBRIDGE_HOME/config`, else `$XDG_CONFIG_HOME/chatbridge`,
/// else `~/.config/chatbridge`. Not created; a missing directory just means no config.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    resolve_config_dir(|k| env::var_os(k))
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

fn resolve_config_dir(var: impl Fn(&str) -> Option<OsString>) -> anyhow::Result<PathBuf> {
    let set = |k: &str| var(k).filter(|v| !v.is_empty()).map(PathBuf::from);

    if let Some(base) = set("CHATBRIDGE_HOME") {
        return Ok(base.join("config"));
    }
    if let Some(xdg) = set("XDG_CONFIG_HOME") {
        return Ok(xdg.join(APP_DIR));
    }
    // HOME is standard on Unix; USERPROFILE covers Windows.
    let home = set("HOME")
        .or_else(|| set("USERPROFILE"))
        .context("neither HOME nor USERPROFILE is set")?;
    Ok(home.join(".config").join(APP_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars.iter().map(|(k, v)| (k.to_string(), OsString::from(v))).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn precedence_of_config_locations() {
        let all = lookup(&[("CHATBRIDGE_HOME", "/cb"), ("XDG_CONFIG_HOME", "/xdg"), ("HOME", "/home/u")]);
        assert_eq!(resolve_config_dir(all).unwrap(), PathBuf::from("/cb/config"));

        let xdg = lookup(&[("XDG_CONFIG_HOME", "/xdg"), ("HOME", "/home/u")]);
        assert_eq!(resolve_config_dir(xdg).unwrap(), PathBuf::from("/xdg/chatbridge"));

        let home = lookup(&[("XDG_CONFIG_HOME", ""), ("HOME", "/home/u")]);
        assert_eq!(resolve_config_dir(home).unwrap(), PathBuf::from("/home/u/.config/chatbridge"));
    }

    #[test]
    fn no_home_is_an_error() {
        assert!(resolve_config_dir(lookup(&[])).is_err());
    }
}
