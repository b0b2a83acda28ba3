use std::cell::Cell;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::imageops::{self, FilterType};
use image::RgbImage;
use roomwatch_core::processor::encode_first_face;
use roomwatch_core::recognizer::ARCFACE_ENCODING_DIM;
use roomwatch_core::store::{add_known_person, delete_person};
use roomwatch_core::{
    Config, DeleteOutcome, EnrollOutcome, Encoding, FaceDetector, FaceRecognizer, KnownStore,
};
use roomwatch_hw::{Camera, FrameSource};

/// Live enrollment evaluates every Nth frame.
const LIVE_FRAME_SKIP: u64 = 5;
const LIVE_WIDTH: u32 = 640;
const LIVE_HEIGHT: u32 = 480;

#[derive(Parser)]
#[command(name = "roomwatch", about = "Manage the faces roomwatch recognizes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new person from a still image or the webcam
    Enroll {
        /// Name of the person to add (prompted if omitted)
        #[arg(short, long)]
        name: Option<String>,
        /// Enroll from this image file
        #[arg(short, long, conflicts_with = "live")]
        image: Option<PathBuf>,
        /// Enroll from a live webcam capture
        #[arg(long)]
        live: bool,
    },
    /// Remove an enrolled person
    Delete {
        /// Name of the person to delete (prompted if omitted)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List enrolled people
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Image(PathBuf),
    Live,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll { name, image, live } => {
            let name = match name {
                Some(name) => name.trim().to_string(),
                None => prompt("Enter the name of the person to add: ")?,
            };
            enroll(&config, &name, image, live)?;
        }
        Commands::Delete { name } => {
            let name = match name {
                Some(name) => name.trim().to_string(),
                None => prompt("Enter the name of the person to delete: ")?,
            };
            let outcome = delete_person(&config.store_path, &name)?;
            println!("{}", delete_message(outcome, &name));
        }
        Commands::List => list(&config.store_path)?,
    }

    Ok(())
}

fn prompt(question: &str) -> Result<String> {
    print!("{question}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn parse_source(choice: &str) -> Option<Source> {
    match choice.trim().to_ascii_lowercase().as_str() {
        "live" => Some(Source::Live),
        "image" => Some(Source::Image(PathBuf::new())),
        _ => None,
    }
}

fn enroll(config: &Config, name: &str, image: Option<PathBuf>, live: bool) -> Result<()> {
    if name.is_empty() {
        println!("A name is required.");
        return Ok(());
    }

    let store = KnownStore::load_or_empty(&config.store_path)?;
    store.check_dimensions(ARCFACE_ENCODING_DIM)?;
    if !config.store_path.exists() {
        println!("No existing encodings found. Creating a new database.");
    }
    if store.contains(name) {
        println!("{}", enroll_message(EnrollOutcome::AlreadyExists, name, &Source::Live));
        return Ok(());
    }

    let source = match (image, live) {
        (Some(path), _) => Source::Image(path),
        (None, true) => Source::Live,
        (None, false) => {
            let choice = prompt(
                "How do you want to train the model? Enter 'live' for live capture or 'image' for an image file: ",
            )?;
            match parse_source(&choice) {
                Some(Source::Image(_)) => {
                    Source::Image(PathBuf::from(prompt("Enter the path to the image file: ")?))
                }
                Some(source) => source,
                None => {
                    println!("Invalid choice. Please enter 'live' or 'image'.");
                    return Ok(());
                }
            }
        }
    };

    let aborted = Cell::new(false);
    let outcome = add_known_person(&config.store_path, name, || -> Result<Option<Encoding>> {
        let mut detector = FaceDetector::load(&config.detector_model_path())?;
        let mut recognizer = FaceRecognizer::load(&config.recognizer_model_path())?;
        match &source {
            Source::Image(path) => {
                let image = image::open(path)
                    .with_context(|| format!("Could not load image from '{}'.", path.display()))?
                    .to_rgb8();
                Ok(encode_first_face(&mut detector, &mut recognizer, &image)?)
            }
            Source::Live => capture_live(config, name, &mut detector, &mut recognizer, &aborted),
        }
    })?;

    if !aborted.get() {
        println!("{}", enroll_message(outcome, name, &source));
    }
    Ok(())
}

fn enroll_message(outcome: EnrollOutcome, name: &str, source: &Source) -> String {
    match (outcome, source) {
        (EnrollOutcome::Added, _) => format!("{name} added to known encodings."),
        (EnrollOutcome::AlreadyExists, _) => {
            format!("The name '{name}' already exists in the database.")
        }
        (EnrollOutcome::NoFaceDetected, Source::Image(_)) => {
            "No face detected in the provided image. Try again with a different image.".to_string()
        }
        (EnrollOutcome::NoFaceDetected, Source::Live) => "No face detected.".to_string(),
    }
}

fn delete_message(outcome: DeleteOutcome, name: &str) -> String {
    match outcome {
        DeleteOutcome::Removed => {
            format!("The name '{name}' has been successfully removed from the database.")
        }
        DeleteOutcome::NotFound => format!("The name '{name}' does not exist in the database."),
        DeleteOutcome::NoStore => "No encoding file found. Nothing to delete.".to_string(),
    }
}

/// Lines typed on stdin, forwarded from a reader thread.
fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Stream the webcam until the user captures a face (Enter) or quits (`q`).
fn capture_live(
    config: &Config,
    name: &str,
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
    aborted: &Cell<bool>,
) -> Result<Option<Encoding>> {
    let camera = Camera::open(&config.camera_device, LIVE_WIDTH, LIVE_HEIGHT)
        .context("Error accessing webcam.")?;
    let mut stream = camera.stream().context("Error accessing webcam.")?;
    stream.discard(config.warmup_frames);

    println!("Capturing image. Press Enter to capture, or type 'q' and Enter to quit.");
    let commands = stdin_lines();
    let mut latest: Option<RgbImage> = None;
    let mut frame_count = 0u64;

    loop {
        let frame = match stream.next_frame() {
            Ok(frame) => frame,
            Err(e) if e.is_frame_local() => {
                tracing::debug!(error = %e, "skipping unreadable frame");
                continue;
            }
            Err(e) => return Err(e).context("Error accessing webcam."),
        };
        frame_count += 1;
        if frame_count % LIVE_FRAME_SKIP == 0 {
            latest = Some(imageops::resize(
                &frame.image,
                LIVE_WIDTH,
                LIVE_HEIGHT,
                FilterType::Triangle,
            ));
        }

        let command = match commands.try_recv() {
            Ok(command) => command,
            Err(TryRecvError::Empty) => continue,
            Err(TryRecvError::Disconnected) => {
                println!("Exiting without saving.");
                aborted.set(true);
                return Ok(None);
            }
        };

        if command.trim().eq_ignore_ascii_case("q") {
            println!("Exiting without saving.");
            aborted.set(true);
            return Ok(None);
        }

        let Some(small) = &latest else {
            println!("Camera is still starting. Try again.");
            continue;
        };
        match encode_first_face(detector, recognizer, small)? {
            Some(encoding) => {
                println!("Face captured for {name}.");
                return Ok(Some(encoding));
            }
            None => println!("No face detected. Try again."),
        }
    }
}

fn list(store_path: &Path) -> Result<()> {
    let store = KnownStore::load_or_empty(store_path)?;
    if store.is_empty() {
        println!("No known faces enrolled.");
        return Ok(());
    }
    for person in store.people() {
        println!(
            "{}: {} encoding(s), enrolled {}",
            person.name,
            person.encodings.len(),
            person.enrolled_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}
