//! Recognized configuration options.

use clap::Parser;

/// Options controlling attach-time behavior and the translation core.
#[derive(Parser, Clone, Debug)]
#[command(name = "granary", disable_help_flag = false)]
pub struct Options {
    /// Comma-separated list of tool names to load.
    #[arg(long = "tools", default_value = "")]
    pub tools: String,

    /// Modules to instrument.
    #[arg(long = "attach_to", default_value = "*")]
    pub attach_to: String,

    /// Pause at startup printing the process id, so a debugger can
    /// attach.
    #[arg(long = "show_gdb_prompt", default_value_t = true, action = clap::ArgAction::Set)]
    pub show_gdb_prompt: bool,

    /// Where ordinary output goes.
    #[arg(long = "output_log_file", default_value = "/dev/stdout")]
    pub output_log_file: String,

    /// Where debug output goes.
    #[arg(long = "debug_log_file", default_value = "/dev/stderr")]
    pub debug_log_file: String,

    /// Shared libraries to load as clients (user mode only).
    #[arg(long = "clients", default_value = "")]
    pub clients: String,

    /// Pages reserved for the block code cache.
    #[arg(long = "block_cache_pages", default_value_t = 1024)]
    pub block_cache_pages: usize,

    /// Pages reserved for the edge code cache.
    #[arg(long = "edge_cache_pages", default_value_t = 512)]
    pub edge_cache_pages: usize,

    /// Threshold distinguishing extended exception-table entries; this
    /// tracks an OS-version-dependent layout.
    #[arg(long = "extable_error_sentinel", default_value_t = crate::os::extable::DEFAULT_ERROR_SENTINEL)]
    pub extable_error_sentinel: i64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tools: String::new(),
            attach_to: "*".to_string(),
            show_gdb_prompt: true,
            output_log_file: "/dev/stdout".to_string(),
            debug_log_file: "/dev/stderr".to_string(),
            clients: String::new(),
            block_cache_pages: 1024,
            edge_cache_pages: 512,
            extable_error_sentinel: crate::os::extable::DEFAULT_ERROR_SENTINEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let opts = Options::default();
        assert_eq!(opts.attach_to, "*");
        assert!(opts.show_gdb_prompt);
        assert_eq!(opts.output_log_file, "/dev/stdout");
    }

    #[test]
    fn parses_overrides() {
        let opts =
            Options::parse_from(["granary", "--tools", "count_bbs", "--attach_to", "libc"]);
        assert_eq!(opts.tools, "count_bbs");
        assert_eq!(opts.attach_to, "libc");
    }
}
