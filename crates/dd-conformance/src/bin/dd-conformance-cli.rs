#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;

use dd_conformance::{
    HarnessConfig, HarnessSettings, SuiteOptions, append_history, enforce_green, run_suite,
    write_report,
};
use dd_runtime::DeviceConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut options = SuiteOptions::default();
    let mut settings_path: Option<PathBuf> = None;
    let mut parallelism: Option<usize> = None;
    let mut use_device = false;
    let mut write_artifacts = false;
    let mut write_history = false;
    let mut require_green = false;
    let mut verbose = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--test" => {
                let value = args
                    .next()
                    .ok_or("--test requires a value (e.g. 001-HelloWorld)")?;
                options.test_filter = Some(value);
            }
            "--toolchain" => {
                let value = args.next().ok_or("--toolchain requires none, dx or jack")?;
                options.toolchains = parse_list(&value)?;
            }
            "--compiler" => {
                let value = args
                    .next()
                    .ok_or("--compiler requires a value (e.g. d8,r8_after_d8)")?;
                options.compilers = parse_list(&value)?;
            }
            "--runtime" => {
                let value = args
                    .next()
                    .ok_or("--runtime requires a value (e.g. host-7.0.0, target-default, jvm)")?;
                options.runtimes = parse_list(&value)?;
            }
            "--mode" => {
                let value = args.next().ok_or("--mode requires debug or release")?;
                options.modes = parse_list(&value)?;
            }
            "--parallelism" => {
                let value = args.next().ok_or("--parallelism requires a number")?;
                parallelism = Some(value.parse()?);
            }
            "--settings" => {
                let value = args.next().ok_or("--settings requires a path")?;
                settings_path = Some(PathBuf::from(value));
            }
            "--device" => {
                use_device = true;
            }
            "--write-report" => {
                write_artifacts = true;
            }
            "--write-history" => {
                write_history = true;
            }
            "--require-green" => {
                require_green = true;
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    init_logging(verbose);

    let mut config = HarnessConfig::default_paths();
    if let Some(path) = settings_path {
        config = config.with_settings(HarnessSettings::load(&path)?);
    }
    if let Some(parallelism) = parallelism {
        config.parallelism = parallelism.max(1);
    }
    if use_device && config.device.is_none() {
        config.device = Some(DeviceConfig::default());
    }

    let report = run_suite(&config, &options)?;
    println!(
        "suite={} cells={} passed={} expected_failures={} unexpected_failures={} \
         ignored={} aborted={} green={}",
        report.suite,
        report.cell_count,
        report.passed,
        report.expected_failures,
        report.unexpected_failures,
        report.ignored,
        report.aborted,
        report.is_green()
    );
    for failure in report.failures() {
        println!("  FAIL {} [{}]", failure.test, failure.axes);
    }

    if write_artifacts {
        let path = write_report(&config, &report)?;
        println!("wrote report={}", path.display());
    }
    if write_artifacts || write_history {
        let path = append_history(&config, &report)?;
        println!("wrote history={}", path.display());
    }
    if require_green {
        enforce_green(&report)?;
    }

    Ok(())
}

fn parse_list<T>(value: &str) -> Result<Vec<T>, T::Err>
where
    T: FromStr,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(T::from_str)
        .collect()
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();
}

fn print_help() {
    println!(
        "dd-conformance-cli\n\
         Usage:\n\
         \tdd-conformance-cli [--test NAME] [--compiler d8,r8] [--runtime host-default]\n\
         \t                   [--require-green]\n\
         Options:\n\
         \t--test <substring>     Run only tests whose name contains the substring\n\
         \t--toolchain <list>     Input toolchains: none, dx, jack\n\
         \t--compiler <list>      d8, r8, r8_cf, r8_after_d8, d8_after_r8_cf\n\
         \t--runtime <list>       jvm, host-<version>, target-<version>\n\
         \t--mode <list>          debug, release (default: each compiler's own mode)\n\
         \t--parallelism <n>      Cells run concurrently\n\
         \t--settings <path>      YAML overrides for paths, timeouts and the device\n\
         \t--device               Enable device runs with default device settings\n\
         \t--write-report         Write artifacts/conformance/report.json and append history\n\
         \t--write-history        Append the run summary to artifacts/conformance/history.jsonl\n\
         \t--require-green        Exit non-zero on any unexpected failure or aborted cell\n\
         \t-v, --verbose          Debug logging (RUST_LOG overrides)\n\
         \t-h, --help             Show this help"
    );
}
