use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;
use thiserror::Error;
use zeroize::Zeroizing;

use secure_cryptor_queue::crypto::xts::{generate_key, XTS_KEY_SIZE};
use secure_cryptor_queue::{
    format_bytes, AreaBounds, BlockDevice, ConversionConfig, ConversionEngine, ConversionError, ConversionRequest,
    CryptoError, DeviceHeaderStore, EncryptedIoQueue, FileDevice, PersistHeader, QueueConfig, QueueError,
    TaskOutcome, WipeAlgorithm, WipeRequest, XtsCryptoContext, DATA_UNIT_SIZE,
};

/// Size of the sidecar file holding the encrypted area record.
const SIDECAR_SIZE: u64 = DATA_UNIT_SIZE as u64;

#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Queue(#[from] QueueError),
    #[error("{0}")]
    Conversion(#[from] ConversionError),
    #[error("{0}")]
    Crypto(#[from] CryptoError),
    #[error("Image size must be a non-zero multiple of 512 bytes")]
    InvalidImageSize,
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Task failed: {0}")]
    Task(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = "Encrypts, decrypts and wipes disk images in place through an encrypted block I/O queue.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a random XTS-AES-256 key
    Keygen {
        /// File to write the 64-byte key to
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Create a zero-filled image
    Create {
        #[arg(short, long)]
        image: PathBuf,
        /// Image size in bytes
        #[arg(short, long)]
        size: u64,
    },
    /// Encrypt the image in place, resuming an interrupted run
    Encrypt {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long)]
        key: PathBuf,
        /// Wipe algorithm applied to the plaintext: 1-rand, dod3, dod7, gutmann35
        #[arg(short, long)]
        wipe: Option<WipeAlgorithm>,
        /// Zero-fill unreadable sectors instead of failing
        #[arg(long)]
        zero_unreadable: bool,
        /// Conversion block size in bytes
        #[arg(long)]
        block_size: Option<usize>,
    },
    /// Decrypt the image in place
    Decrypt {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long)]
        key: PathBuf,
        /// Substitute zeros for unreadable sectors instead of failing
        #[arg(long)]
        skip_unreadable: bool,
        #[arg(long)]
        block_size: Option<usize>,
    },
    /// Read a range through the queue and write the plaintext to stdout
    Read {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long)]
        key: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 512)]
        length: usize,
    },
    /// Irreversibly wipe the image with a one-time key
    Wipe {
        #[arg(short, long)]
        image: PathBuf,
        #[arg(short, long, default_value = "1-rand")]
        algorithm: WipeAlgorithm,
    },
    /// Show the persisted encrypted area of the image
    Status {
        #[arg(short, long)]
        image: PathBuf,
    },
}

fn main() -> Result<(), CliError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output } => {
            let key = generate_key();
            fs::write(&output, key.as_slice())?;
            println!("Key written to '{}'", output.display());
        }
        Commands::Create { image, size } => {
            if size == 0 || size % DATA_UNIT_SIZE as u64 != 0 {
                return Err(CliError::InvalidImageSize);
            }
            FileDevice::create(&image, size)?;
            FileDevice::create(&sidecar_path(&image), SIDECAR_SIZE)?;
            println!("Created '{}' ({})", image.display(), format_bytes(size));
        }
        Commands::Encrypt {
            image,
            key,
            wipe,
            zero_unreadable,
            block_size,
        } => {
            let mut request = ConversionRequest::encrypt();
            request.wipe_algorithm = wipe;
            request.zero_unreadable = zero_unreadable;
            let outcome = convert(&image, &key, request, block_size)?;
            finish(outcome, "Encryption")?;
        }
        Commands::Decrypt {
            image,
            key,
            skip_unreadable,
            block_size,
        } => {
            let mut request = ConversionRequest::decrypt();
            request.skip_unreadable = skip_unreadable;
            let outcome = convert(&image, &key, request, block_size)?;
            finish(outcome, "Decryption")?;
        }
        Commands::Read {
            image,
            key,
            offset,
            length,
        } => {
            let (queue, _header) = open_queue(&image, Some(&key))?;
            let completion = queue.read(offset, length);
            if !completion.status.is_success() {
                return Err(CliError::Request(completion.status.to_string()));
            }
            io::stdout().write_all(&completion.data)?;
            queue.stop()?;
        }
        Commands::Wipe { image, algorithm } => {
            let (queue, header) = open_queue(&image, None)?;
            let engine = ConversionEngine::new(queue, header, ConversionConfig::default())
                .with_progress_callback(progress_printer());
            let request = WipeRequest {
                key: Zeroizing::new(generate_key().to_vec()),
                algorithm,
            };
            let outcome = engine.start_wipe(request)?.wait();
            eprintln!();
            finish(outcome, "Wipe")?;
        }
        Commands::Status { image } => {
            let store = sidecar_store(&image)?;
            let size = fs::metadata(&image)?.len();
            match store.load_region()? {
                Some(record) => println!(
                    "Encrypted: [{}, {}] ({} of {})",
                    record.start,
                    record.end,
                    format_bytes(record.length()),
                    format_bytes(size)
                ),
                None => println!("Not encrypted ({})", format_bytes(size)),
            }
        }
    }

    Ok(())
}

fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".region");
    PathBuf::from(name)
}

fn sidecar_store(image: &Path) -> Result<DeviceHeaderStore, CliError> {
    let path = sidecar_path(image);
    let device = if path.exists() {
        FileDevice::open(&path)?
    } else {
        FileDevice::create(&path, SIDECAR_SIZE)?
    };
    Ok(DeviceHeaderStore::new(Arc::new(device), 0))
}

fn load_key(path: &Path) -> Result<XtsCryptoContext, CliError> {
    let key = Zeroizing::new(fs::read(path)?);
    if key.len() != XTS_KEY_SIZE {
        return Err(CryptoError::InvalidKeySize {
            expected: XTS_KEY_SIZE,
            actual: key.len(),
        }
        .into());
    }
    Ok(XtsCryptoContext::new(&key)?)
}

/// Opens the image behind a filter queue whose configured area is the whole
/// image and whose encrypted area comes from the sidecar record.
fn open_queue(
    image: &Path,
    key: Option<&Path>,
) -> Result<(Arc<EncryptedIoQueue>, Arc<dyn PersistHeader>), CliError> {
    let device = FileDevice::open(image)?;
    let size = device.size()?;
    if size == 0 || size % DATA_UNIT_SIZE as u64 != 0 {
        return Err(CliError::InvalidImageSize);
    }

    let header: Arc<dyn PersistHeader> = Arc::new(sidecar_store(image)?);
    let encrypted = header
        .load_region()?
        .map(|record| record.bounds())
        .unwrap_or(AreaBounds::EMPTY);
    info!("Opened '{}' ({}), encrypted area {:?}", image.display(), format_bytes(size), encrypted);

    let crypto = match key {
        Some(path) => load_key(path)?,
        None => XtsCryptoContext::random(),
    };

    let config = QueueConfig::filter()
        .with_areas(encrypted, AreaBounds::with_length(0, size))
        .with_read_ahead(size);
    let queue = EncryptedIoQueue::start(config, Arc::new(crypto), Arc::new(device))?;
    Ok((Arc::new(queue), header))
}

fn convert(
    image: &Path,
    key: &Path,
    request: ConversionRequest,
    block_size: Option<usize>,
) -> Result<TaskOutcome, CliError> {
    let (queue, header) = open_queue(image, Some(key))?;
    let mut config = ConversionConfig::default();
    if let Some(block_size) = block_size {
        config.block_size = block_size;
    }

    let engine = ConversionEngine::new(queue, header, config).with_progress_callback(progress_printer());
    let outcome = engine.start_conversion(request)?.wait();
    eprintln!();

    let status = engine.conversion_status()?;
    println!("Encrypted area end: {}", status.current_end);
    engine.queue().stop()?;
    Ok(outcome)
}

fn progress_printer() -> secure_cryptor_queue::ProgressCallback {
    Arc::new(|progress, processed, total| {
        eprint!(
            "\r{:5.1}%  {} / {}",
            progress * 100.0,
            format_bytes(processed),
            format_bytes(total)
        );
    })
}

fn finish(outcome: TaskOutcome, what: &str) -> Result<(), CliError> {
    if outcome.is_success() {
        println!("{} finished.", what);
        Ok(())
    } else {
        Err(CliError::Task(
            outcome.message.unwrap_or_else(|| outcome.status.to_string()),
        ))
    }
}
