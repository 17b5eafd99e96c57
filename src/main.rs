use clap::Parser;
use lamarun::bytefile::Bytefile;
use lamarun::interpreter::Interpreter;
use lamarun::runtime::Io;
use std::process::ExitCode;

/// Lama VM bytecode interpreter
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Source bytecode file
    image: String,

    /// Dump parsed bytefile metadata
    #[arg(long, default_value_t = false)]
    dump_bytefile: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let bytefile = match Bytefile::load(&args.image) {
        Ok(bf) => bf,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    if args.dump_bytefile {
        println!("{}", bytefile);
    }

    let mut interp = match Interpreter::new(bytefile, Io::stdio()) {
        Ok(interp) => interp,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = interp.run() {
        eprintln!("{}", err);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
