use std::env;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process;

use env_logger::Env;
use hmmv::{io, ViterbiObserver, HMM};
use log::{error, info, warn};
use ndarray::ArrayView1;

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let options = match Options::parse(env::args().skip(1)) {
        Ok(opts) => opts,
        Err(err) => {
            error!("{}", err);
            eprint!("{}", HELP);
            process::exit(2);
        }
    };

    if let Err(err) = run(&options) {
        error!("{}", err);
        process::exit(1);
    }
}

fn run(options: &Options) -> hmmv::Result<()> {
    if options.output.is_none() {
        warn!("--output is not specified; no results will be saved");
    }

    let hmm: HMM = io::read_model(BufReader::new(open(&options.input_model)?))?;
    let ys = io::read_observations(BufReader::new(open(&options.input)?))?;
    if options.verbose {
        eprintln!(
            "observations: {} × {}; model: {} states of dimensionality {}",
            ys.rows(),
            ys.cols(),
            hmm.n(),
            hmm.dimensionality()
        );
    }

    let path = if options.verbose {
        hmm.viterbi_with(ys.view(), &mut StderrObserver)?
    } else {
        hmm.viterbi(ys.view())?
    };

    if let Some(output) = &options.output {
        let file = File::create(output).map_err(|e| with_path(output, e))?;
        io::write_states(BufWriter::new(file), path.states.view())?;
        info!("saved {} states to {}", path.states.len(), output.display());
    }
    Ok(())
}

fn open(path: &Path) -> hmmv::Result<File> {
    File::open(path).map_err(|e| with_path(path, e).into())
}

fn with_path(path: &Path, err: std::io::Error) -> std::io::Error {
    std::io::Error::new(err.kind(), format!("{}: {}", path.display(), err))
}

/// Step-by-step trace on stderr, for `--verbose`
struct StderrObserver;

impl ViterbiObserver for StderrObserver {
    fn initialized(&mut self, delta: ArrayView1<f64>) {
        eprintln!("t=0 delta={}", delta);
    }

    fn step(&mut self, t: usize, delta: ArrayView1<f64>, psi: ArrayView1<usize>) {
        eprintln!("t={} delta={} psi={}", t, delta, psi);
    }

    fn terminated(&mut self, final_state: usize, log_prob: f64) {
        eprintln!("final state {} log-probability {}", final_state, log_prob);
    }
}

#[derive(Debug, PartialEq)]
struct Options {
    input: PathBuf,
    input_model: PathBuf,
    output: Option<PathBuf>,
    verbose: bool,
}

impl Options {
    fn parse<I, T>(mut args: I) -> Result<Self, String>
    where
        I: Iterator<Item = T>,
        T: Into<String>,
    {
        let mut input = None;
        let mut input_model = None;
        let mut output = None;
        let mut verbose = false;

        while let Some(arg) = args.next() {
            let arg = arg.into();
            let mut value_of = |name: &str| -> Result<PathBuf, String> {
                args.next()
                    .map(|value| PathBuf::from(value.into()))
                    .ok_or_else(|| format!("missing value after {}", name))
            };
            match arg.as_str() {
                "-h" | "--help" => {
                    print!("{}", HELP);
                    process::exit(0);
                }
                "-i" | "--input" => input = Some(value_of(&arg)?),
                "-m" | "--input_model" => input_model = Some(value_of(&arg)?),
                "-o" | "--output" => output = Some(value_of(&arg)?),
                "-v" | "--verbose" => verbose = true,
                _ => return Err(format!("unrecognized argument '{}'", arg)),
            }
        }

        Ok(Self {
            input: input.ok_or_else(|| "--input is required".to_string())?,
            input_model: input_model.ok_or_else(|| "--input_model is required".to_string())?,
            output,
            verbose,
        })
    }
}

const HELP: &str = "\
Usage: hmm_viterbi --input <FILE> --input_model <FILE> [--output <FILE>] [--verbose]

Compute the most probable hidden state sequence of a sequence of observations, given a
trained HMM, using the Viterbi algorithm.

Options:
  -i, --input <FILE>          Observations: one time step per line, values separated by
                              commas or whitespace
  -m, --input_model <FILE>    Trained HMM, as JSON
  -o, --output <FILE>         File to save the predicted state sequence to, one state per line
  -v, --verbose               Trace every step of the algorithm on stderr
  -h, --help                  Print this help message

Example:
  hmm_viterbi --input obs.txt --input_model hmm.json --output states.txt

Set RUST_LOG=debug for more detail on what is being decoded.
";
