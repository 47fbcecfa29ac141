//! Open an instrument link, optionally send something, do one timed read, and print what arrived.
//!
//! Ctrl-C interrupts a running read through the handle's cancel token. Set `RUST_LOG=debug` (or
//! `trace`) to see what the link and the read loop are doing.

use std::{error::Error, process::ExitCode};

use clap::{Parser, Subcommand};
use instrumentlink::{
    DeviceError, DeviceHandle, SerialConfig, SerialDevice, TcpClient, TcpClientConfig, TcpServer,
    TcpServerConfig, Timeout, UdpConfig, UdpPort,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    link: Link,

    /// Number of bytes to read
    #[arg(short = 'n', long, default_value = "64")]
    count: usize,

    /// Read timeout in seconds (0 polls once, "inf" waits forever)
    #[arg(short, long, default_value = "3")]
    timeout: f64,

    /// Send this line (terminator appended) before reading
    #[arg(short, long)]
    send: Option<String>,

    /// Line terminator, with \n and \r escapes
    #[arg(long, default_value = "\\n")]
    terminator: String,

    /// Read one line instead of a byte count
    #[arg(short, long)]
    line: bool,
}

#[derive(Subcommand, Debug)]
enum Link {
    /// Connect to a TCP server, e.g., 192.168.1.10:5025
    Tcp { address: String },
    /// Listen on a local address and wait for one client
    TcpServer { bind: String },
    /// Bind a UDP port; replies go to --remote
    Udp {
        bind: String,
        #[arg(short, long)]
        remote: Option<std::net::SocketAddr>,
    },
    /// Open a serial port
    Serial {
        path: String,
        #[arg(short, long, default_value = "9600")]
        baud: u32,
    },
}

fn unescape(terminator: &str) -> String {
    terminator.replace("\\r", "\r").replace("\\n", "\n")
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let timeout = Timeout::from_secs_f64(args.timeout)?;
    let terminator = unescape(&args.terminator);
    match &args.link {
        Link::Tcp { address } => {
            let config = TcpClientConfig::default()
                .timeout(timeout)
                .terminator(&terminator);
            read_interruptibly(TcpClient::open(address, config)?, args)
        }
        Link::TcpServer { bind } => {
            let config = TcpServerConfig::default()
                .timeout(timeout)
                .terminator(&terminator);
            let mut server = TcpServer::open(bind, config)?;
            log::info!("Waiting for a client on {}", server.local_addr());
            let token = server.interrupt_token();
            ctrlc::set_handler(move || token.cancel())?;
            match server.accept(Timeout::Forever)? {
                Some(client) => log::info!("Client {client} connected"),
                None => return Ok(()),
            }
            read_and_print(server, args)
        }
        Link::Udp { bind, remote } => {
            let mut config = UdpConfig::default()
                .timeout(timeout)
                .terminator(&terminator);
            config.remote = *remote;
            read_interruptibly(UdpPort::open(bind, config)?, args)
        }
        Link::Serial { path, baud } => {
            let config = SerialConfig::default()
                .baud_rate(*baud)
                .timeout(timeout)
                .terminator(&terminator);
            read_interruptibly(SerialDevice::open(path, config)?, args)
        }
    }
}

fn read_interruptibly<H: DeviceHandle>(handle: H, args: &Args) -> Result<(), Box<dyn Error>> {
    let token = handle.interrupt_token();
    ctrlc::set_handler(move || token.cancel())?;
    read_and_print(handle, args)
}

fn read_and_print<H: DeviceHandle>(mut handle: H, args: &Args) -> Result<(), Box<dyn Error>> {
    if let Some(cmd) = &args.send {
        handle.write_line(cmd)?;
    }

    if args.line {
        println!("{}", handle.read_line()?);
        return Ok(());
    }

    let mut buf = vec![0u8; args.count];
    let n = match handle.read(&mut buf) {
        Ok(n) => n,
        Err(DeviceError::Interrupted { bytes_read }) => {
            log::warn!("Interrupted after {bytes_read} bytes");
            bytes_read
        }
        Err(e) => return Err(e.into()),
    };
    if n < args.count {
        log::info!("Short read: {n} of {} bytes", args.count);
    }
    println!("{:?}", String::from_utf8_lossy(&buf[..n]));
    handle.close();
    Ok(())
}
