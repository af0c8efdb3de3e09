use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use llama3_inference::{BenchConfig, Configuration, GgmlType, run_benchmark};

/// Define the bench subcommand.
fn bench_subcommand() -> Command {
    Command::new("bench")
        .about("Run generation on a randomly initialised Llama 3 model and report throughput")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Hugging Face config.json to take the model shape from")
                .conflicts_with_all(["dim", "hidden-dim", "layers", "heads", "kv-heads", "vocab", "max-seq-len"]),
        )
        .arg(dimension_arg("dim", "Embedding dimension", "256"))
        .arg(dimension_arg("hidden-dim", "Feed-forward dimension", "768"))
        .arg(dimension_arg("layers", "Number of decoder layers", "4"))
        .arg(dimension_arg("heads", "Number of query heads", "8"))
        .arg(dimension_arg("kv-heads", "Number of key/value heads", "2"))
        .arg(dimension_arg("vocab", "Vocabulary size", "4096"))
        .arg(dimension_arg("max-seq-len", "Maximum sequence length of the model", "512"))
        .arg(
            Arg::new("quantization")
                .short('q')
                .long("quantization")
                .value_name("TYPE")
                .help("Weight encoding")
                .default_value("q8_0")
                .value_parser(["q8_0", "q4_0", "f16", "f32"]),
        )
        .arg(
            Arg::new("untied")
                .long("untied")
                .help("Use a separate classifier instead of the token embedding table")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("threads")
                .short('j')
                .long("threads")
                .value_name("INT")
                .help("Worker threads, (default) = available parallelism")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max_seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("prompt-length")
                .long("prompt-length")
                .value_name("INT")
                .help("Number of prompt tokens to ingest before sampling [default: 16]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Positions to run, prompt included, (default) = context size")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], default 1.0")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1], default 0.95")
                .default_value("0.95")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed for weights and sampling")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn dimension_arg(name: &'static str, help: &'static str, default: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_name("INT")
        .help(help)
        .default_value(default)
        .value_parser(clap::value_parser!(usize))
}

fn parse_ggml_type(name: &str) -> Result<GgmlType> {
    match name {
        "q8_0" => Ok(GgmlType::Q8_0),
        "q4_0" => Ok(GgmlType::Q4_0),
        "f16" => Ok(GgmlType::F16),
        "f32" => Ok(GgmlType::F32),
        other => anyhow::bail!("Unknown quantization: {other}"),
    }
}

fn model_configuration(matches: &ArgMatches) -> Result<Configuration> {
    if let Some(config_path) = matches.get_one::<String>("config") {
        return Configuration::from_hf_file(config_path);
    }

    let dimension = |name: &str| -> Result<usize> {
        matches.get_one::<usize>(name).copied().ok_or_else(|| anyhow::anyhow!("Missing value for --{name}"))
    };

    Configuration::builder()
        .dim(dimension("dim")?)
        .hidden_dim(dimension("hidden-dim")?)
        .number_of_layers(dimension("layers")?)
        .number_of_heads(dimension("heads")?)
        .number_of_key_value_heads(dimension("kv-heads")?)
        .vocabulary_size(dimension("vocab")?)
        .context_length(dimension("max-seq-len")?)
        .build()
}

/// Run the bench command with the provided arguments
fn run_bench_command(matches: &ArgMatches) -> Result<()> {
    let ggml_type = matches.get_one::<String>("quantization").map(|name| parse_ggml_type(name)).transpose()?;

    let config = BenchConfig::builder()
        .configuration(model_configuration(matches)?)
        .ggml_type(ggml_type)
        .tied_embeddings(Some(!matches.get_flag("untied")))
        .threads(matches.get_one::<usize>("threads").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .prompt_length(matches.get_one::<usize>("prompt-length").copied())
        .max_tokens(matches.get_one::<usize>("max-tokens").copied())
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    let report = run_benchmark(config).map_err(|e| anyhow::anyhow!("Benchmark failed: {e:#}"))?;

    info!("Prompt tokens: {}", report.prompt_tokens());
    info!("Generated tokens: {}", report.generated_tokens.len());
    info!("Load time: {:.2}s", report.load_seconds);
    info!("Generation time: {:.2}s", report.generation_seconds);
    info!("Throughput: {:.2} tokens/s", report.tokens_per_second());

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("llama3")
        .about("Llama 3 CLI: CPU inference benchmarks on quantized models")
        .subcommand(bench_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("bench", matches)) => run_bench_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e}");
        std::process::exit(1);
    }
}
