use std::path::PathBuf;

/// Removes `--config <path>` / `--config=<path>` from `args`.
pub(crate) fn extract_config_arg(
    args: &[String],
) -> Result<(Vec<String>, Option<PathBuf>), String> {
    let mut updated = Vec::with_capacity(args.len());
    let mut selected = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let value = iter
                .next()
                .ok_or_else(|| format!("{arg} requires a path"))?;
            selected = Some(PathBuf::from(value));
            continue;
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            if value.is_empty() {
                return Err("--config requires a path".to_string());
            }
            selected = Some(PathBuf::from(value));
            continue;
        }
        updated.push(arg.clone());
    }
    Ok((updated, selected))
}

pub(crate) fn is_version_request(args: &[String]) -> bool {
    matches!(args, [arg] if arg == "--version" || arg == "-V")
}

/// Expands the relay argument template for one config file.
pub(crate) fn relay_command_args(template: &str, config_path: &str) -> Result<Vec<String>, String> {
    let words = shell_words::split(template).map_err(|err| err.to_string())?;
    Ok(words
        .into_iter()
        .map(|word| word.replace("{config}", config_path))
        .collect())
}
