use std::path::Path;

use anyhow::Context;
use fm_core::config::Config;

pub fn show(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_toml().context("failed to render config")?);
    Ok(())
}

pub fn check(path: Option<&Path>) -> anyhow::Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(Config::default_path);
    if !path.exists() {
        println!("{}: not found, defaults apply", path.display());
        return Ok(());
    }
    let config = Config::load_from(&path)
        .with_context(|| format!("{} is invalid", path.display()))?;
    println!(
        "{}: ok ({} runner(s) configured)",
        path.display(),
        config.runners.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_reports_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.toml");
        std::fs::write(&good, "[queue]\nworkers = 2\n").unwrap();
        assert!(check(Some(&good)).is_ok());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[queue]\nmax_attempts = 0\n").unwrap();
        let err = check(Some(&bad)).unwrap_err();
        assert!(format!("{err:#}").contains("max_attempts"));

        assert!(check(Some(&dir.path().join("missing.toml"))).is_ok());
    }
}
