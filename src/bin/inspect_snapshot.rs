use medallion::storage::{ParquetStore, Storage, Tier};
use medallion::table::{self, TableSchema};
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::{env, fs::File, process::exit};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 || args.len() > 5 {
        eprintln!("Usage: {} <DATA_ROOT> <bronze|silver|gold> <NAME> [ROWS]", args[0]);
        exit(1);
    }
    let tier = match args[2].parse::<Tier>() {
        Ok(tier) => tier,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    let rows = args.get(4).and_then(|r| r.parse().ok()).unwrap_or(10);
    if let Err(e) = inspect(&args[1], tier, &args[3], rows) {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

/// Print file metadata, the Arrow schema and the first `rows` rows.
fn inspect(root: &str, tier: Tier, name: &str, rows: usize) -> Result<(), Box<dyn std::error::Error>> {
    let store = ParquetStore::new(root)?;
    let path = store.snapshot_path(tier, name);

    // 1) Parquet file-level metadata
    let reader = SerializedFileReader::new(File::open(&path)?)?;
    let meta = reader.metadata();
    println!("=== {} snapshot: {} ===", tier, path.display());
    println!("Total rows:           {}", meta.file_metadata().num_rows());
    println!("Number of row groups: {}", meta.num_row_groups());
    println!("File-size on disk:    {} bytes", std::fs::metadata(&path)?.len());
    if meta.num_row_groups() > 0 {
        let rg = meta.row_group(0);
        for col in rg.columns() {
            println!(
                "  {:<30} {:?}, {} bytes compressed",
                col.column_descr().name(),
                col.compression(),
                col.compressed_size()
            );
        }
    }
    println!();

    // 2) Arrow view
    let batch = store.load(tier, name)?;
    let desc = TableSchema::of(&batch);
    println!("=== Columns ===");
    for field in batch.schema().fields() {
        let kind = desc
            .kind(field.name())
            .map(|k| k.to_string())
            .unwrap_or_default();
        println!("- {:<30} | {:<12} | {}", field.name(), kind, field.data_type());
    }
    println!();

    println!("=== First {} rows ===", rows.min(batch.num_rows()));
    for row in 0..rows.min(batch.num_rows()) {
        println!("{}", serde_json::to_string(&table::row_to_json(&batch, row))?);
    }
    Ok(())
}
