use blockpress::builder::CONFIG_FILE;
use blockpress::schema::{load_definitions, GeneratorRegistry};
use blockpress::validation::validate_definitions;
use blockpress::{Builder, RawValues};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::Path;
use std::process;

/// BlockPress CLI: compile block definitions and inspect stored block data
#[derive(Parser)]
#[command(name = "blockpress", version, about)]
struct Cli {
    /// Path to the data directory (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: String,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Compile the definitions and print the field group
    Compile {
        /// Write the compiled field group to a file instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// Print the flat index of the published schema
    Flatmap,

    /// Look up one compiled node id
    Lookup {
        /// Compiled node id (e.g. field_3f2a...)
        id: String,
    },

    /// Rehydrate stored rows of a layout
    Rehydrate {
        /// Layout name
        layout: String,
        /// JSON file holding an array of stored rows (stdin when omitted)
        #[arg(long)]
        input: Option<String>,
    },

    /// Rehydrate a content item's builder row with the layout it selects
    Item {
        /// JSON file holding the item's builder row (stdin when omitted)
        #[arg(long)]
        input: Option<String>,
    },

    /// Turn rehydrated blocks back into stored rows
    Flatten {
        /// JSON file holding an array of rehydrated blocks (stdin when omitted)
        #[arg(long)]
        input: Option<String>,
    },

    /// Lint the definitions without publishing
    Validate,

    /// Show the published schema, history and cache stats
    Status,

    /// Recompile whenever a definition file changes
    Watch,

    /// Drop every cached rendering
    ClearCache,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = cli.data_dir.as_str();
    let open = || Builder::open(data_dir);

    match cli.command {
        Command::Compile { output } => {
            let schema = open()?.compile()?;
            let group = serde_json::to_value(&schema.group)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, serde_json::to_string_pretty(&group)?)
                        .map_err(|e| format!("Failed to write '{path}': {e}"))?;
                    print_output(
                        &serde_json::json!({
                            "ok": true,
                            "source_hash": schema.source_hash,
                            "nodes": schema.flatmap.len(),
                            "output": path,
                        }),
                        &cli.format,
                    )?;
                }
                None => print_output(&group, &cli.format)?,
            }
        }

        Command::Flatmap => {
            let schema = open()?.schema()?;
            let entries = serde_json::to_value(schema.flatmap.sorted_entries())?;
            print_output(&entries, &cli.format)?;
        }

        Command::Lookup { id } => match open()?.lookup(&id)? {
            Some(entry) => print_output(&serde_json::to_value(entry)?, &cli.format)?,
            None => return Err(format!("Unknown node id: {id}").into()),
        },

        Command::Rehydrate { layout, input } => {
            let rows = read_rows(input)?;
            let blocks = open()?.rehydrate_layout(&layout, &rows, &RawValues)?;
            print_output(&serde_json::Value::Array(blocks), &cli.format)?;
        }

        Command::Item { input } => {
            let row = match read_input(input)? {
                serde_json::Value::Object(row) => row,
                _ => return Err("Item input must be a JSON object".into()),
            };
            match open()?.rehydrate_item(&row, &RawValues)? {
                Some(item) => print_output(&serde_json::to_value(item)?, &cli.format)?,
                None => print_output(&serde_json::json!({ "enabled": false }), &cli.format)?,
            }
        }

        Command::Flatten { input } => {
            let blocks = read_rows(input)?;
            let rows = open()?.flatten_layout(&blocks)?;
            print_output(&serde_json::Value::Array(rows), &cli.format)?;
        }

        Command::Validate => {
            // Linting must work on definitions that do not compile.
            let definitions = load_definitions(&Path::new(data_dir).join(CONFIG_FILE))?;
            let result = validate_definitions(&definitions, &GeneratorRegistry::with_builtins());
            print_output(&serde_json::to_value(&result)?, &cli.format)?;
            if !result.is_ok() {
                return Err(format!("{} validation error(s)", result.errors.len()).into());
            }
        }

        Command::Status => {
            print_output(&open()?.status()?, &cli.format)?;
        }

        Command::Watch => {
            let builder = open()?;
            let watcher = builder.watch()?;
            log::info!("Watching {data_dir} for definition changes");
            for batch in watcher.event_rx.iter() {
                let paths: Vec<String> = batch.iter().map(|c| c.path.display().to_string()).collect();
                match builder.reload() {
                    Ok(schema) => print_output(
                        &serde_json::json!({
                            "ok": true,
                            "changed": paths,
                            "source_hash": schema.source_hash,
                        }),
                        &cli.format,
                    )?,
                    Err(e) => print_output(
                        &serde_json::json!({
                            "ok": false,
                            "changed": paths,
                            "error": e.to_string(),
                        }),
                        &cli.format,
                    )?,
                }
            }
        }

        Command::ClearCache => {
            let removed = open()?.clear_cache()?;
            print_output(&serde_json::json!({ "ok": true, "removed": removed }), &cli.format)?;
        }
    }

    Ok(())
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
        }
    }
    Ok(())
}

fn read_rows(input: Option<String>) -> Result<Vec<serde_json::Value>, Box<dyn std::error::Error>> {
    let rows: Vec<serde_json::Value> = serde_json::from_value(read_input(input)?)?;
    Ok(rows)
}

fn read_input(input: Option<String>) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let content = match input {
        Some(path) => std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read input file '{path}': {e}"))?,
        None => {
            use std::io::Read;
            let mut content = String::new();
            std::io::stdin().read_to_string(&mut content)?;
            content
        }
    };
    Ok(serde_json::from_str(&content)?)
}
