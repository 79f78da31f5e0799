use serde_json::Value;
use structopt::StructOpt;

use std::ffi;

use dstore::{err_at, Config, Database, Result};

/// Run a diagnostic command against a database directory.
#[derive(Clone, StructOpt)]
struct Opt {
    /// Load configuration from this toml file.
    #[structopt(long = "config")]
    config: Option<ffi::OsString>,

    #[structopt(long = "pretty")]
    pretty: bool,

    /// Evict all pages before running the command, pagesInRAM shall report
    /// only what the command itself touches.
    #[structopt(long = "cold")]
    cold: bool,

    dir: ffi::OsString,

    /// Command as a JSON document, like `{"indexStats": "test.docs", "index": "_id_"}`.
    command: String,
}

fn main() {
    let opts = Opt::from_iter(std::env::args_os());

    match run(opts) {
        Ok(()) => (),
        Err(err) => {
            println!("Error: {}", err);
            std::process::exit(1);
        }
    }
}

fn run(opts: Opt) -> Result<()> {
    let config = match opts.config.as_ref() {
        Some(loc) => Config::from_toml(&opts.dir, loc)?,
        None => Config::new(&opts.dir),
    };
    let cmd: Value = err_at!(InvalidInput, serde_json::from_str(&opts.command))?;

    let db = Database::open(config)?;
    if opts.cold {
        for name in db.to_collection_names()?.iter() {
            db.collection(name)?.evict_pages()?;
        }
    }

    let res = db.run_command(&cmd);
    let text = if opts.pretty {
        err_at!(FailConvert, serde_json::to_string_pretty(&res))?
    } else {
        res.to_string()
    };
    println!("{}", text);

    db.close()
}
