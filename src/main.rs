use ssalift::*;

use std::path::PathBuf;

use clap::Parser;

/// Recover control flow and SSA form from machine code micro-operations
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Analyse the functions of a textual micro-op listing
    FromListing {
        /// Path to the listing (see `listing_lifter` for the format)
        listing: PathBuf,
        /// Only analyse the function with this name (and whatever it calls)
        #[clap(long)]
        function: Option<String>,
        /// Path to dump the SSA form of every analysed function to
        #[clap(long)]
        dump_ssa: Option<PathBuf>,
        /// Output the control-flow graph (with dominator tree) of the selected function as a
        /// GraphViz `.dot` file to the given path. Requires `--function`.
        #[clap(long)]
        output_dot: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Maximum number of instructions decoded per function
        #[clap(long)]
        max_instructions: Option<usize>,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<analysis_config::CommandLineAnalysisConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromListing {
            listing,
            function,
            dump_ssa,
            output_dot,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            max_instructions,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            analysis_config::AnalysisConfig::initialize(advanced_config);

            let listing = listing_lifter::lift_from(
                &std::fs::read_to_string(listing).expect("Listing file could not be read"),
            )
            .unwrap_or_else(|e| {
                log::crit!("Could not lift listing"; "err" => %e);
                std::process::exit(1)
            });

            let mut limits = session::Limits::default();
            if let Some(m) = max_instructions {
                limits.max_instructions = m;
            }
            let mut session = listing.into_session(limits);

            let selected = function.map(|name| {
                session.find_func_by_name(&name).unwrap_or_else(|e| {
                    log::crit!("Unknown function"; "err" => %e);
                    std::process::exit(1)
                })
            });
            match selected {
                Some(id) => slog_scope::scope(
                    &slog_scope::logger().new(slog::slog_o!("function" => session.name(id).to_owned())),
                    || session.analyze(id),
                ),
                None => session.analyze_all(),
            }

            for (_, func) in session.functions() {
                println!(
                    "{} @ {:#x}: {} blocks, {} merges, {} jump tables, {} calls, stack depth {}, flags {:?}",
                    func.name,
                    func.addr.offset,
                    func.live_blocks().count(),
                    func.num_merges(),
                    func.jump_tables.len(),
                    func.call_specs.len(),
                    func.stack_depth,
                    func.flags,
                );
            }

            if let Some(path) = dump_ssa {
                use std::io::Write;
                let mut file = std::fs::File::create(path).unwrap();
                for (_, func) in session.functions() {
                    writeln!(file, "{:?}", func.debug_function(&session.arch.spaces)).unwrap();
                }
            }

            if let Some(path) = output_dot {
                use std::io::Write;
                let func = selected.and_then(|id| session.function(id)).unwrap_or_else(|| {
                    log::crit!("--output-dot needs an analysed --function");
                    std::process::exit(1)
                });
                write!(
                    std::fs::File::create(path).unwrap(),
                    "{}",
                    func.generate_dot(true)
                )
                .unwrap();
            }
        }
    }
}
