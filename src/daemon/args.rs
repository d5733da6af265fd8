use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;

/// Started by the browser with the extension origin as argument, which is ignored.
#[derive(Parser)]
#[command(version, about)]
pub struct DaemonArgs {
    /// Application directory holding the store and the logs.
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Mirror logs to stderr. This option is for debugging purposes only.
    #[arg(long = "log-console")]
    pub log_console: bool,
    #[arg(long = "log-filter")]
    pub log: Option<LevelFilter>,
    /// Arguments passed by the browser, such as the calling extension's origin.
    #[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub browser_args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_arguments_are_accepted() {
        let args = DaemonArgs::parse_from([
            "tabwarden",
            "--log-filter",
            "debug",
            "chrome-extension://abcdef/",
        ]);
        assert_eq!(args.log, Some(LevelFilter::DEBUG));
        assert_eq!(args.browser_args, vec!["chrome-extension://abcdef/".to_string()]);
        assert!(args.dir.is_none());
    }
}
