#[macro_use]
extern crate log;

use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use simplelog::{Config, LevelFilter, SimpleLogger};
use structopt::StructOpt;

use stm32_usart_boot::flash::{self, FlashError, FlashOptions, Phase};
use stm32_usart_boot::image::FirmwareImage;
use stm32_usart_boot::protocol::MAX_CHUNK;
use stm32_usart_boot::serial::{SerialError, SerialTransport};
use stm32_usart_boot::{Command, ErasePages, Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "stm32-usart-boot",
    about = "Program STM32 devices over the factory USART bootloader"
)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: u32,

    /// Serial timeout in milliseconds
    #[structopt(long, default_value = "250")]
    timeout_ms: u64,

    /// Do not pulse DTR/RTS to reset the target into its bootloader
    #[structopt(long)]
    no_reset: bool,

    #[structopt(flatten)]
    options: Options,

    #[structopt(subcommand)]
    command: Cmd,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Cmd {
    /// Query the bootloader version, command set and product id
    Info,

    /// Read memory and print it as a hex dump
    Read {
        /// Start address
        #[structopt(long, default_value = "0x08000000", parse(try_from_str = parse_u32))]
        address: u32,

        /// Number of bytes to read
        #[structopt(long, default_value = "256")]
        length: usize,
    },

    /// Erase, write and verify a firmware image (.hex or raw binary)
    Flash(FlashArgs),

    /// Erase flash pages
    Erase {
        /// Page index to erase
        #[structopt(long, required_unless = "all")]
        page: Option<u8>,

        /// Erase every page
        #[structopt(long)]
        all: bool,
    },

    /// Jump to firmware at an address
    Go {
        /// Firmware start address
        #[structopt(default_value = "0x08000000", parse(try_from_str = parse_u32))]
        address: u32,
    },
}

#[derive(Clone, Debug, StructOpt)]
pub struct FlashArgs {
    /// Image file
    file: PathBuf,

    /// Write address; defaults to the image's own start address, or the
    /// beginning of flash for raw binaries
    #[structopt(long, parse(try_from_str = parse_u32))]
    address: Option<u32>,

    /// Fill byte for gaps in HEX images
    #[structopt(long, default_value = "0xFF", parse(try_from_str = parse_u8))]
    fill: u8,

    /// Erasable page size in bytes
    #[structopt(long, default_value = "1024")]
    page_size: usize,

    /// Erase the whole flash array instead of the image's pages
    #[structopt(long)]
    mass_erase: bool,

    /// Use the extended (two-byte addressing) erase command
    #[structopt(long)]
    extended_erase: bool,

    /// Skip the read-back verification pass
    #[structopt(long)]
    no_verify: bool,

    /// Start the firmware once flashing succeeds
    #[structopt(long)]
    run: bool,
}

fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_u8(s: &str) -> Result<u8, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let args = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(args.log_level, Config::default());

    info!("connecting to {} at {} baud", args.port, args.baud);

    let transport = SerialTransport::new(args.port.as_str(), args.baud)
        .timeout(Duration::from_millis(args.timeout_ms));
    let mut programmer = Programmer::new(transport, args.options.clone());

    programmer
        .open()
        .with_context(|| format!("failed to open serial port {}", args.port))?;

    if !args.no_reset {
        flash::reset_into_bootloader(programmer.transport_mut())
            .context("failed to reset the target")?;
    }

    programmer
        .init()
        .context("failed to connect to the bootloader")?;
    info!("bootloader connected");

    let result = run(&mut programmer, &args);

    if let Err(e) = programmer.close() {
        warn!("closing the connection failed: {}", e);
    }

    result
}

fn run(
    programmer: &mut Programmer<SerialTransport, SerialError>,
    args: &Args,
) -> anyhow::Result<()> {
    match &args.command {
        Cmd::Info => info_cmd(programmer),
        Cmd::Read { address, length } => read_cmd(programmer, *address, *length),
        Cmd::Flash(flash_args) => flash_cmd(programmer, flash_args),
        Cmd::Erase { page, all } => erase_cmd(programmer, *page, *all),
        Cmd::Go { address } => {
            programmer.go(*address)?;
            info!("started firmware at 0x{:08x}", address);
            Ok(())
        }
    }
}

fn info_cmd(programmer: &mut Programmer<SerialTransport, SerialError>) -> anyhow::Result<()> {
    let commands = programmer.get()?;
    info!("bootloader v{}.{}", commands.major(), commands.minor());
    for &opcode in &commands.commands {
        match Command::from_opcode(opcode) {
            Some(command) => info!("  0x{:02x} {:?}", opcode, command),
            None => info!("  0x{:02x} (unknown)", opcode),
        }
    }

    let id = programmer.get_id()?;
    info!("product id: 0x{:04x}", id);

    let status = programmer.get_version()?;
    info!(
        "option bytes: 0x{:02x} 0x{:02x}",
        status.option_byte1, status.option_byte2
    );
    Ok(())
}

fn read_cmd(
    programmer: &mut Programmer<SerialTransport, SerialError>,
    address: u32,
    length: usize,
) -> anyhow::Result<()> {
    let bar = progress_bar("reading", length as u64);

    let mut data = Vec::with_capacity(length);
    let mut remaining = length;
    let mut cursor = address;
    while remaining > 0 {
        let chunk = remaining.min(MAX_CHUNK);
        data.extend(programmer.read_memory(cursor, chunk)?);
        cursor += chunk as u32;
        remaining -= chunk;
        bar.set_position(data.len() as u64);
    }
    bar.finish_and_clear();

    for (row, bytes) in data.chunks(16).enumerate() {
        println!(
            "{:08x}  {}",
            address as usize + row * 16,
            hex::encode(bytes)
        );
    }
    Ok(())
}

fn flash_cmd(
    programmer: &mut Programmer<SerialTransport, SerialError>,
    args: &FlashArgs,
) -> anyhow::Result<()> {
    let image = FirmwareImage::load(&args.file, args.fill)
        .with_context(|| format!("failed to load {}", args.file.display()))?;

    let target = args.address.unwrap_or(if image.start != 0 {
        image.start
    } else {
        flash::BASE_ADDRESS
    });
    info!(
        "image: {} at 0x{:08x}",
        bytefmt::format(image.len() as u64),
        target
    );

    let options = FlashOptions {
        base_address: target,
        page_size: args.page_size,
        mass_erase: args.mass_erase,
        extended_erase: args.extended_erase,
        ..FlashOptions::default()
    };

    let mut active: Option<(Phase, ProgressBar)> = None;
    let mut progress = |phase: Phase, done: usize, total: usize| {
        let switch = active
            .as_ref()
            .map_or(true, |(current, _)| *current != phase);
        if switch {
            if let Some((_, bar)) = active.take() {
                bar.finish();
            }
            active = Some((phase, progress_bar(phase_name(phase), total as u64)));
        }
        if let Some((_, bar)) = &active {
            bar.set_position(done as u64);
        }
    };

    let result: Result<(), FlashError<SerialError>> = (|| {
        flash::erase(programmer, image.len(), &options, &mut progress)?;
        flash::write(programmer, &image, &options, &mut progress)?;
        if !args.no_verify {
            flash::verify(programmer, &image, &options, &mut progress)?;
        }
        Ok(())
    })();

    if let Some((_, bar)) = active.take() {
        bar.finish();
    }
    result?;
    info!("flash complete");

    if args.run {
        programmer.go(target)?;
        info!("started firmware at 0x{:08x}", target);
    }
    Ok(())
}

fn erase_cmd(
    programmer: &mut Programmer<SerialTransport, SerialError>,
    page: Option<u8>,
    all: bool,
) -> anyhow::Result<()> {
    if all {
        programmer.erase_memory(ErasePages::Global)?;
        info!("erased every page");
    } else if let Some(index) = page {
        programmer.erase_memory(ErasePages::Page(index))?;
        info!("erased page {}", index);
    } else {
        anyhow::bail!("either --page or --all is required");
    }
    Ok(())
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Erase => "erasing",
        Phase::Write => "writing",
        Phase::Verify => "verifying",
    }
}

fn progress_bar(message: &str, length: u64) -> ProgressBar {
    let bar = ProgressBar::new(length);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>10} [{bar:40.cyan/blue}] {pos}/{len}")
            .progress_chars("=> "),
    );
    bar.set_message(message);
    bar
}
