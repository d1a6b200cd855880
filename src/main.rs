use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_line_sort::{ExternalSorter, ExternalSorterBuilder, MalformedLinePolicy, SortStrategy};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let strategy: Strategy = arg_parser.value_of_t_or_exit("strategy");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let buffer_size = arg_parser
        .value_of("buffer_size")
        .expect("value has default")
        .parse::<ByteSize>()
        .expect("value is pre-validated")
        .as_u64();
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let fan_in: Option<usize> = arg_parser
        .is_present("fan_in")
        .then(|| arg_parser.value_of_t_or_exit("fan_in"));

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_buffer_size(buffer_size)
        .with_strategy(strategy.into());

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(fan_in) = fan_in {
        sorter_builder = sorter_builder.with_fan_in(fan_in);
    }

    if arg_parser.is_present("strict") {
        sorter_builder = sorter_builder.with_malformed_line_policy(MalformedLinePolicy::Strict);
    }

    let sorter: ExternalSorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let input = path::Path::new(arg_parser.value_of("input").expect("value is required"));

    if arg_parser.is_present("stats") {
        let statistics = match sorter.statistics(input, buffer_size) {
            Ok(statistics) => statistics,
            Err(err) => {
                log::error!("statistics error: {}", err);
                process::exit(1);
            }
        };
        log::info!("{}", statistics);

        match serde_json::to_string_pretty(&statistics) {
            Ok(json) => println!("{}", json),
            Err(err) => {
                log::error!("statistics serialization error: {}", err);
                process::exit(1);
            }
        }
        return;
    }

    let output = path::Path::new(arg_parser.value_of("output").expect("value is required"));
    if let Err(err) = sorter.sort(input, output) {
        log::error!("data sorting error: {}", err);
        process::exit(1);
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Strategy {
    Batch,
    Streaming,
    Prefix,
}

impl Strategy {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Strategy::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Strategy as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Strategy> for SortStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Batch => SortStrategy::BatchChunked,
            Strategy::Streaming => SortStrategy::BoundedMemoryStreaming,
            Strategy::Prefix => SortStrategy::PrefixPartitioned,
        }
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-line-sort")
        .about("external sorter of `<number>. <text>` line files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required_unless_present("stats")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("strategy")
                .short('s')
                .long("strategy")
                .help("run generation strategy")
                .takes_value(true)
                .default_value("batch")
                .possible_values(Strategy::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("fan_in")
                .short('f')
                .long("fan-in")
                .help("maximum number of runs merged at once")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("buffer_size")
                .short('b')
                .long("buffer-size")
                .help("memory buffer size hint")
                .takes_value(true)
                .default_value("1MiB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Buffer size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("strict")
                .long("strict")
                .help("fail on malformed lines instead of skipping them"),
        )
        .arg(
            clap::Arg::new("stats")
                .long("stats")
                .help("print sorting cost estimate as JSON instead of sorting"),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
