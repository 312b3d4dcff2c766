use torque_cache::CacheOpts;

use crate::task_graph::OutputLogsMode;

/// Everything a resolved invocation carries into the engine. Flag parsing
/// happens upstream; these are the already-validated knobs.
#[derive(Debug, Default, Clone)]
pub struct Opts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
    pub run_cache_opts: RunCacheOpts,
}

#[derive(Debug, Clone)]
pub struct RunOpts {
    pub tasks: Vec<String>,
    pub concurrency: u32,
    pub parallel: bool,
    pub continue_on_error: bool,
    pub single_package: bool,
    pub pass_through_args: Vec<String>,
    pub log_prefix: ResolvedLogPrefix,
    pub summarize: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            concurrency: num_cpus::get() as u32,
            parallel: false,
            continue_on_error: false,
            single_package: false,
            pass_through_args: Vec::new(),
            log_prefix: ResolvedLogPrefix::Task,
            summarize: false,
        }
    }
}

impl RunOpts {
    /// The invocation re-rendered as a command line, recorded in the run
    /// summary.
    pub fn synthesize_command(&self) -> String {
        let mut cmd = format!("turbo run {}", self.tasks.join(" "));
        if self.parallel {
            cmd.push_str(" --parallel");
        }
        if self.continue_on_error {
            cmd.push_str(" --continue");
        }
        if !self.pass_through_args.is_empty() {
            cmd.push_str(" -- ");
            cmd.push_str(&self.pass_through_args.join(" "));
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedLogPrefix {
    Task,
    None,
}

#[derive(Debug, Default, Clone)]
pub struct RunCacheOpts {
    pub skip_reads: bool,
    pub skip_writes: bool,
    pub task_output_logs_override: Option<OutputLogsMode>,
}
