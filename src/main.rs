use rayon::prelude::*;
use spmtok::convert::{convert_tokenizer_json, ConvertOptions};
use spmtok::{decode_string, DecoderStatus, EncodeOptions, Encoder, EncoderResult};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Default)]
struct Args {
    command: Option<String>,
    model: Option<String>,
    output: Option<String>,
    encoding_offset: i32,
    bos: bool,
    eos: bool,
    reverse: bool,
    json: bool,
    help: bool,
    version: bool,
    rest: Vec<String>,
}

fn value_of(argv: &[String], i: usize, flag: &str) -> String {
    match argv.get(i) {
        Some(v) => v.clone(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut args = Args::default();

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-V" | "--version" => args.version = true,
            "-h" | "--help" => args.help = true,
            "--bos" => args.bos = true,
            "--eos" => args.eos = true,
            "--reverse" => args.reverse = true,
            "--json" => args.json = true,
            "-m" | "--model" => {
                i += 1;
                args.model = Some(value_of(&argv, i, "--model"));
            }
            "-o" | "--output" => {
                i += 1;
                args.output = Some(value_of(&argv, i, "--output"));
            }
            "--encoding-offset" => {
                i += 1;
                let raw = value_of(&argv, i, "--encoding-offset");
                args.encoding_offset = raw.parse().unwrap_or_else(|_| {
                    eprintln!("Error: --encoding-offset expects an integer, got '{}'", raw);
                    std::process::exit(1);
                });
            }
            // Negative ids are valid arguments to `decode`.
            s if s.starts_with('-') && s.parse::<i32>().is_err() => {
                eprintln!("Error: unknown option: {}", s);
                std::process::exit(1);
            }
            s if args.command.is_none() => args.command = Some(s.to_string()),
            s => args.rest.push(s.to_string()),
        }
        i += 1;
    }
    args
}

fn print_help() {
    println!(
        "Usage: spmtok <command> [options] [args...]\n\
         \n\
         SentencePiece-compatible unigram tokenizer.\n\
         \n\
         Commands:\n\
         \x20 encode -m <model.enc> [path...]     Encode files (or stdin) to piece ids\n\
         \x20 decode -m <model.dec> <id...>       Decode piece ids to text\n\
         \x20 convert -o <prefix> <tokenizer.json> Write <prefix>.enc and <prefix>.dec\n\
         \n\
         Options:\n\
         \x20 -m, --model <file>       Encoder or decoder config blob\n\
         \x20 --bos                    Prepend the start code\n\
         \x20 --eos                    Append the end code\n\
         \x20 --reverse                Emit codes end-to-start\n\
         \x20 --json                   Print codes and offsets as JSON\n\
         \x20 -o, --output <prefix>    Output prefix for convert\n\
         \x20 --encoding-offset <n>    Id shift applied by convert (default: 0)\n\
         \x20 -V, --version            Show version\n\
         \x20 -h, --help               Show this help\n\
         \n\
         Set RUST_LOG=debug for diagnostics on stderr."
    );
}

fn read_blob(path: Option<&str>, what: &str) -> Vec<u8> {
    let path = path.unwrap_or_else(|| {
        eprintln!("Error: {} requires -m <file>", what);
        std::process::exit(1);
    });
    fs::read(path).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", path, e);
        std::process::exit(1);
    })
}

struct Input {
    name: Option<String>,
    text: Vec<u8>,
}

fn read_inputs(paths: &[String]) -> Vec<Input> {
    if paths.is_empty() {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf).unwrap_or_else(|e| {
            eprintln!("Error reading stdin: {}", e);
            std::process::exit(1);
        });
        return vec![Input { name: None, text: buf }];
    }
    paths
        .iter()
        .map(|p| {
            let path = PathBuf::from(p);
            if path.is_dir() {
                eprintln!("Error: {}: Is a directory", p);
                std::process::exit(1);
            }
            let text = fs::read(&path).unwrap_or_else(|e| {
                eprintln!("Error reading {}: {}", p, e);
                std::process::exit(1);
            });
            Input {
                name: Some(p.clone()),
                text,
            }
        })
        .collect()
}

fn format_codes(codes: &[i32]) -> String {
    codes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn run_encode(args: &Args) {
    let blob = read_blob(args.model.as_deref(), "encode");
    let encoder = Encoder::from_bytes(&blob).unwrap_or_else(|e| {
        eprintln!("Error loading encoder config: {}", e);
        std::process::exit(1);
    });
    let options = EncodeOptions {
        add_bos: args.bos,
        add_eos: args.eos,
        reverse: args.reverse,
    };

    let inputs = read_inputs(&args.rest);
    let encode_one = |input: &Input| encoder.encode(&input.text, options);
    let results: Vec<EncoderResult> = if inputs.len() > 1 {
        inputs.par_iter().map(encode_one).collect()
    } else {
        inputs.iter().map(encode_one).collect()
    };

    for (input, result) in inputs.iter().zip(&results) {
        if args.json {
            let mut obj = serde_json::json!({
                "codes": result.codes,
                "offsets": result.offsets,
            });
            if let Some(name) = &input.name {
                obj["file"] = serde_json::json!(name);
            }
            println!("{}", obj);
        } else if inputs.len() > 1 {
            println!("{}\t{}", input.name.as_deref().unwrap_or(""), format_codes(&result.codes));
        } else {
            println!("{}", format_codes(&result.codes));
        }
    }
}

fn run_decode(args: &Args) {
    let blob = read_blob(args.model.as_deref(), "decode");
    let codes: Vec<i32> = args
        .rest
        .iter()
        .map(|s| {
            s.parse().unwrap_or_else(|_| {
                eprintln!("Error: not a piece id: {}", s);
                std::process::exit(1);
            })
        })
        .collect();

    let result = decode_string(&codes, &blob);
    match result.status {
        DecoderStatus::Success => println!("{}", result.text),
        DecoderStatus::WrongConfig => {
            eprintln!("Error: unsupported or corrupted decoder config");
            std::process::exit(1);
        }
        DecoderStatus::InvalidInput => {
            eprintln!("Error: piece id out of range for this decoder");
            std::process::exit(1);
        }
    }
}

fn run_convert(args: &Args) {
    let prefix = args.output.as_deref().unwrap_or_else(|| {
        eprintln!("Error: convert requires -o <prefix>");
        std::process::exit(1);
    });
    let [source] = args.rest.as_slice() else {
        eprintln!("Error: convert takes exactly one tokenizer.json");
        std::process::exit(1);
    };
    let json = fs::read_to_string(source).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", source, e);
        std::process::exit(1);
    });

    let options = ConvertOptions {
        encoding_offset: args.encoding_offset,
    };
    let model = convert_tokenizer_json(&json, options).unwrap_or_else(|e| {
        eprintln!("Error converting {}: {}", source, e);
        std::process::exit(1);
    });

    for (ext, bytes) in [("enc", &model.encoder), ("dec", &model.decoder)] {
        let path = format!("{}.{}", prefix, ext);
        if let Err(e) = fs::write(&path, bytes) {
            eprintln!("Error writing {}: {}", path, e);
            std::process::exit(1);
        }
        tracing::info!(path = %path, bytes = bytes.len(), "wrote config");
    }
    println!("{} pieces -> {}.enc, {}.dec", model.vocab_size, prefix, prefix);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = parse_args();

    if args.version {
        println!("spmtok {}", VERSION);
        return;
    }
    if args.help {
        print_help();
        return;
    }

    match args.command.as_deref() {
        Some("encode") => run_encode(&args),
        Some("decode") => run_decode(&args),
        Some("convert") => run_convert(&args),
        Some(other) => {
            eprintln!("Error: unknown command '{}'\nAvailable: encode, decode, convert", other);
            std::process::exit(1);
        }
        None => {
            print_help();
            std::process::exit(1);
        }
    }
}
