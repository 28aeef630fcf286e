use anyhow::Result;
use clap::Parser;
use indicatif::ProgressBar;

use p1load::constants::DEFAULT_BAUD_RATE;
use p1load::transport::SerialTransport;
use p1load::{LoadType, Loader, Phase, ProgressSink};

#[derive(clap::Parser)]
#[command(
    name = "p1load",
    about = "Load a spin binary into a Parallax Propeller P1 over serial",
    version
)]
struct Cli {
    /// Serial port of the Propeller (first detected port when omitted)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Program the EEPROM after loading
    #[arg(short, long)]
    eeprom: bool,

    /// Run the program after loading (the default unless -e is given alone)
    #[arg(short, long)]
    run: bool,

    /// List available serial ports and exit
    #[arg(short = 'P', long)]
    list_ports: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// The spin binary to load
    file: Option<String>,
}

/// Drives a progress bar for the Program phase and logs the rest.
#[derive(Default)]
struct CliProgress {
    bar: Option<ProgressBar>,
}

impl CliProgress {
    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl ProgressSink for CliProgress {
    fn report(&mut self, phase: Phase, current: usize, total: usize) {
        match phase {
            Phase::Program => {
                let bar = self
                    .bar
                    .get_or_insert_with(|| ProgressBar::new(total as u64));
                bar.set_position(current as u64);
            }
            Phase::EepromWrite => {
                self.finish();
                log::info!("Programming EEPROM");
            }
            Phase::EepromVerify => log::info!("Verifying EEPROM"),
            Phase::Done => {
                self.finish();
                log::info!("Load complete");
            }
            _ => (),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if cli.list_ports {
        for port in SerialTransport::scan_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let Some(file) = cli.file.as_deref() else {
        anyhow::bail!("no image file given, see --help");
    };

    // -e alone loads the EEPROM without starting the program
    let load_type = match (cli.eeprom, cli.run) {
        (false, _) => LoadType::Run,
        (true, false) => LoadType::Eeprom,
        (true, true) => LoadType::EepromRun,
    };

    let image = p1load::format::read_spin_binary(file)?;

    let transport = match cli.port.as_deref() {
        Some(port) => SerialTransport::open(port, cli.baud)?,
        None => SerialTransport::open_any(cli.baud)?,
    };

    let mut loader = Loader::new(transport).with_progress(Box::new(CliProgress::default()));
    loader.handshake()?;
    loader.load_image(load_type, &image)?;

    Ok(())
}
