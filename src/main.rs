/// fcsim – run one FCS Monte-Carlo dispatch and print the histograms.
///
///   fcsim                              → defaults: 1 droplet, 1x1 grid, 10 s
///   fcsim -n 1000 -g 4 -w 16           → 1000 droplets on a 4x16 grid
///   fcsim --config run.json --json     → parameters from JSON, JSON report
///   fcsim --diagnostic -v              → debug scalars and timing, info logs
use std::env;
use std::path::PathBuf;
use std::process::{self, ExitCode};
use std::str::FromStr;

use fcsim::error::FcsError;
use fcsim::logging::{self, LogConfig};
use fcsim::report::{self, ConsoleReport};
use fcsim::{ResultSet, RunMode, RunParameters, Simulation, SimulationConfig, SoftwareDevice};
use tracing::error;

fn usage() {
    eprintln!("fcsim - FCS Monte-Carlo dispatch");
    eprintln!();
    eprintln!("Usage: fcsim [OPTIONS]");
    eprintln!();
    eprintln!("Run parameters:");
    eprintln!("  -n, --droplets N         Droplets to simulate (default: 1)");
    eprintln!("  -g, --workgroups N       Work-groups in the grid (default: 1)");
    eprintln!("  -w, --workitems N        Work-items per work-group (default: 1)");
    eprintln!("  -e, --end-time S         Simulated seconds per droplet (default: 10)");
    eprintln!("  -r, --photon-rate R      Photons per intensity per second (default: 1)");
    eprintln!("  --global-capacity N      Histogram bins per work-group (default: 1000)");
    eprintln!("  --local-capacity N       Scratch slots per work-item (default: 1000)");
    eprintln!("  -c, --config FILE        Read run parameters from a JSON file first");
    eprintln!();
    eprintln!("Simulation:");
    eprintln!("  -p, --program PATH       Kernel source (default: program.cl)");
    eprintln!("  --entry NAME             Kernel entry point (default: fcs)");
    eprintln!("  --seed N                 RNG seed");
    eprintln!("  --rng-reserved N         Scratch slots reserved for RNG state (default: 4)");
    eprintln!("  -D, --diagnostic         Diagnostic run: debug scalars and timing");
    eprintln!("  --release                Release run (overrides the diagnostic feature)");
    #[cfg(feature = "opencl")]
    eprintln!("  --opencl                 Run on an OpenCL device instead of the CPU");
    eprintln!();
    eprintln!("Output:");
    eprintln!("  --json                   Print the result set as JSON");
    eprintln!("  -v, --verbose            More logging (repeat for more)");
    eprintln!("  -q, --quiet              Errors only");
    eprintln!("  -h, --help               Show this help");
    eprintln!();
    eprintln!("RUST_LOG overrides -v/-q. Logs go to stderr.");
}

#[derive(Debug, Default)]
struct Opts {
    config: Option<PathBuf>,
    droplets: Option<u32>,
    workgroups: Option<u32>,
    workitems: Option<u32>,
    end_time: Option<f64>,
    photon_rate: Option<f32>,
    global_capacity: Option<u32>,
    local_capacity: Option<u32>,
    program: Option<PathBuf>,
    entry: Option<String>,
    seed: Option<u64>,
    rng_reserved: Option<u32>,
    mode: Option<RunMode>,
    opencl: bool,
    json: bool,
    verbosity: i32,
}

impl Opts {
    /// Config file first, then flag overrides.
    fn parameters(&self) -> Result<RunParameters, FcsError> {
        let mut params = match &self.config {
            Some(path) => RunParameters::from_json_file(path)?,
            None => RunParameters::default(),
        };
        if let Some(n) = self.droplets {
            params.total_droplets = n;
        }
        if let Some(n) = self.workgroups {
            params.workgroups = n;
        }
        if let Some(n) = self.workitems {
            params.workitems = n;
        }
        if let Some(s) = self.end_time {
            params.end_time = s;
        }
        if let Some(r) = self.photon_rate {
            params.photons_per_intensity_per_time = r;
        }
        if let Some(n) = self.global_capacity {
            params.global_buffer_size_per_workgroup = n;
        }
        if let Some(n) = self.local_capacity {
            params.local_buffer_size_per_workitem = n;
        }
        Ok(params)
    }

    fn simulation_config(&self) -> SimulationConfig {
        let mut config = SimulationConfig::default();
        if let Some(path) = &self.program {
            config.program_path = path.clone();
        }
        if let Some(entry) = &self.entry {
            config.entry_point = entry.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(n) = self.rng_reserved {
            config.rng_reserved = n;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        config
    }
}

fn parse_args(args: &[String]) -> Result<Opts, String> {
    let mut opts = Opts::default();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-h" | "--help" => {
                usage();
                process::exit(0);
            }
            "-D" | "--diagnostic" => opts.mode = Some(RunMode::Diagnostic),
            "--release" => opts.mode = Some(RunMode::Release),
            "--json" => opts.json = true,
            "--opencl" => opts.opencl = true,
            "-v" | "--verbose" => opts.verbosity += 1,
            "-q" | "--quiet" => opts.verbosity = -1,
            "-c" | "--config" => opts.config = Some(PathBuf::from(value(args, &mut i)?)),
            "-p" | "--program" => opts.program = Some(PathBuf::from(value(args, &mut i)?)),
            "--entry" => opts.entry = Some(value(args, &mut i)?.to_string()),
            "-n" | "--droplets" => opts.droplets = Some(number(args, &mut i)?),
            "-g" | "--workgroups" => opts.workgroups = Some(number(args, &mut i)?),
            "-w" | "--workitems" => opts.workitems = Some(number(args, &mut i)?),
            "-e" | "--end-time" => opts.end_time = Some(number(args, &mut i)?),
            "-r" | "--photon-rate" => opts.photon_rate = Some(number(args, &mut i)?),
            "--global-capacity" => opts.global_capacity = Some(number(args, &mut i)?),
            "--local-capacity" => opts.local_capacity = Some(number(args, &mut i)?),
            "--seed" => opts.seed = Some(number(args, &mut i)?),
            "--rng-reserved" => opts.rng_reserved = Some(number(args, &mut i)?),
            // combined short flags like -vv or -Dv
            s if s.starts_with('-') && !s.starts_with("--") && s.len() > 2 => {
                for ch in s[1..].chars() {
                    match ch {
                        'v' => opts.verbosity += 1,
                        'q' => opts.verbosity = -1,
                        'D' => opts.mode = Some(RunMode::Diagnostic),
                        _ => return Err(format!("unknown flag '-{ch}'")),
                    }
                }
            }
            other => return Err(format!("unexpected argument '{other}'")),
        }
        i += 1;
    }
    Ok(opts)
}

fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("missing argument for {flag}"))
}

fn number<T: FromStr>(args: &[String], i: &mut usize) -> Result<T, String> {
    let flag = args[*i].clone();
    let raw = value(args, i)?;
    raw.parse()
        .map_err(|_| format!("invalid value '{raw}' for {flag}"))
}

fn run(opts: &Opts) -> Result<ResultSet, FcsError> {
    let params = opts.parameters()?;
    let config = opts.simulation_config();

    #[cfg(feature = "opencl")]
    if opts.opencl {
        let device = fcsim::opencl::OpenClDevice::create().map_err(FcsError::DeviceUnavailable)?;
        return Simulation::init(device, config)?.run(&params);
    }
    if opts.opencl {
        return Err(FcsError::DeviceUnavailable(fcsim::error::DeviceError::Build(
            "fcsim was built without the `opencl` feature".to_string(),
        )));
    }

    Simulation::init(SoftwareDevice::new(), config)?.run(&params)
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("fcsim: {msg}");
            eprintln!("fcsim: run 'fcsim --help' for usage");
            return ExitCode::from(2);
        }
    };

    let log = LogConfig::default().with_directive(logging::directive_for_verbosity(opts.verbosity));
    if let Err(e) = logging::init_tracing(&log) {
        eprintln!("fcsim: logging disabled: {e}");
    }

    let results = match run(&opts) {
        Ok(results) => results,
        Err(e) => {
            error!(kind = ?e.kind(), "run failed");
            eprintln!("fcsim: {e}");
            return ExitCode::FAILURE;
        }
    };

    if opts.json {
        match report::to_json(&results) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("fcsim: cannot encode report: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print!("{}", ConsoleReport(&results));
    }
    ExitCode::SUCCESS
}
