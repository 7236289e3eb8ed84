use cfmap::codec::Codec;
use cfmap::map::Initializer;
use cfmap::offline;
use serde_json::Value;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "convert" => cmd_convert(&args[2..]),
        "verify" => cmd_verify(&args[2..]),
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_convert(args: &[String]) -> Result<(), String> {
    let map_id = parse_flag_value(args, "--map-id").ok_or("--map-id is required")?;
    let buckets = parse_flag_value(args, "--buckets").ok_or("--buckets is required")?;
    let buckets: i64 = buckets
        .parse()
        .map_err(|e| format!("invalid --buckets: {e}"))?;
    let input = parse_flag_value(args, "--input").ok_or("--input is required")?;
    let out = parse_flag_value(args, "--out").ok_or("--out is required")?;
    let codec = match parse_flag_value(args, "--codec") {
        Some(id) => Codec::from_id(&id).map_err(|e| format!("invalid --codec: {e}"))?,
        None => Codec::default(),
    };

    let raw = fs::read(&input).map_err(|e| format!("read {input}: {e}"))?;
    let pairs: Vec<(Value, Value)> =
        serde_json::from_slice(&raw).map_err(|e| format!("parse {input}: {e}"))?;
    let initializer = Initializer::<Value, Value>::new(map_id, buckets, codec, codec)
        .map_err(|e| format!("initializer: {e}"))?;
    let report = offline::write_bulk_file(
        &initializer,
        pairs.iter().map(|(k, v)| (k, v)),
        Path::new(&out),
    )
    .map_err(|e| format!("convert: {e}"))?;
    println!(
        "ok\t{}\t{}\t{}\t{}",
        report.map_id, report.buckets, report.entries, report.checksum_hex
    );
    Ok(())
}

fn cmd_verify(args: &[String]) -> Result<(), String> {
    let input = parse_flag_value(args, "--input").ok_or("--input is required")?;
    let report =
        offline::verify_bulk_file(Path::new(&input)).map_err(|e| format!("verify: {e}"))?;
    println!(
        "ok\t{}\t{}\t{}\t{}",
        report.map_id, report.buckets, report.entries, report.checksum_hex
    );
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!(
        "  cfm convert --map-id <id> --buckets <n> --input <pairs.json> --out <file> [--codec msgpack|json]"
    );
    eprintln!("  cfm verify --input <file>");
}
