use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use rayon::prelude::*;

use landmark::{
    ChannelSink, Error, FingerprintGenerator, FingerprintHash, FingerprintStore, FnSink, HashBatch,
    Matcher, Profile, TrackId, Verdict, WavSource, best_match, config, db, matching,
    visualize::{Layer, SpectrogramRecorder},
};

/// Upper bound for `--max-seconds`, about three days at the default rate.
const MAX_MATCHING_FRAMES: usize = 1 << 30;

#[derive(Parser)]
#[command(name = "landmark", version, about = "Landmark audio fingerprinting and alignment")]
struct Cli {
    #[command(flatten)]
    profile: ProfileArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ProfileArgs {
    /// Analysis sampling rate in Hz
    #[arg(long, global = true, default_value_t = config::SAMPLING_RATE)]
    sample_rate: u32,
    #[arg(long, global = true, default_value_t = config::WINDOW_SIZE)]
    window_size: usize,
    #[arg(long, global = true, default_value_t = config::HOP_SIZE)]
    hop_size: usize,
    /// Alpha of the running average subtracted from each spectrum
    #[arg(long, global = true, default_value_t = config::TEMPORAL_SMOOTHING_COEFFICIENT)]
    alpha: f32,
    /// Moving-average length across bins, 0 disables
    #[arg(long, global = true, default_value_t = config::SPECTRUM_SMOOTHING_LENGTH)]
    smoothing: usize,
    #[arg(long, global = true, default_value_t = config::PEAKS_PER_FRAME)]
    peaks: usize,
    #[arg(long, global = true, default_value_t = config::PEAK_FANOUT)]
    fanout: usize,
    #[arg(long, global = true, default_value_t = config::MATCHING_MIN_FRAMES)]
    min_frames: usize,
    /// Longest stretch a candidate is evaluated for, in seconds
    #[arg(long, global = true, default_value_t = config::MATCHING_MAX_SECONDS)]
    max_seconds: f64,
}

impl ProfileArgs {
    fn to_profile(&self) -> Result<Profile> {
        let mut profile = Profile {
            sampling_rate: self.sample_rate,
            window_size: self.window_size,
            hop_size: self.hop_size,
            temporal_smoothing_coefficient: self.alpha,
            spectrum_smoothing_length: self.smoothing,
            peaks_per_frame: self.peaks,
            peak_fanout: self.fanout,
            matching_min_frames: self.min_frames,
            ..Profile::default()
        };
        if !self.max_seconds.is_finite() || self.max_seconds <= 0.0 {
            bail!("--max-seconds must be a positive number of seconds");
        }
        if self.hop_size > 0 {
            let frames = profile.frames_per_second() * self.max_seconds;
            profile.matching_max_frames = frames.min(MAX_MATCHING_FRAMES as f64) as usize;
        }
        profile.validate()?;
        Ok(profile)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Fingerprint WAV files into the database
    Index {
        files: Vec<PathBuf>,
        #[arg(long, default_value = "landmark.db")]
        db: String,
    },
    /// Look up a WAV file in the database, stopping at the first accepted match
    Match {
        file: PathBuf,
        #[arg(long, default_value = "landmark.db")]
        db: String,
        /// Keep scanning after the first accepted match
        #[arg(long)]
        all: bool,
    },
    /// List the tracks stored in the database
    Tracks {
        #[arg(long, default_value = "landmark.db")]
        db: String,
    },
    /// Fingerprint WAV files in memory and report their pairwise offsets
    Align { files: Vec<PathBuf> },
    /// Render the spectrogram and extracted peaks of a WAV file to PNG
    Spectrogram {
        file: PathBuf,
        #[arg(long, default_value = "spectrogram.png")]
        out: PathBuf,
        /// Render the plain spectrum instead of the residual
        #[arg(long)]
        spectrum: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let profile = cli.profile.to_profile()?;

    match cli.command {
        Command::Index { files, db } => index(&profile, &files, &db),
        Command::Match { file, db, all } => lookup(&profile, &file, &db, all),
        Command::Tracks { db } => tracks(&db),
        Command::Align { files } => align(&profile, &files),
        Command::Spectrogram {
            file,
            out,
            spectrum,
        } => spectrogram(&profile, &file, &out, spectrum),
    }
}

fn generate_batches(profile: &Profile, path: &Path) -> Result<Vec<HashBatch>> {
    let source = WavSource::open(path, profile.sampling_rate)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut batches = Vec::new();
    let mut last_percent = 0;
    let summary = FingerprintGenerator::generate(
        profile,
        source,
        FnSink(|batch: HashBatch| {
            if let Some(total) = batch.total_frames.filter(|&t| t > 0) {
                let percent = batch.current_frame * 100 / total;
                if percent >= last_percent + 10 {
                    debug!("{}: {}%", path.display(), percent);
                    last_percent = percent;
                }
            }
            batches.push(batch);
        }),
    )
    .with_context(|| format!("fingerprinting {}", path.display()))?;

    info!(
        "{}: {} frames, {} hashes",
        path.display(),
        summary.frames,
        summary.hashes
    );
    Ok(batches)
}

fn index(profile: &Profile, files: &[PathBuf], db_path: &str) -> Result<()> {
    let mut conn = db::setup_database(db_path)?;
    let failures = index_files(profile, &mut conn, files)?;

    if !failures.is_empty() {
        for (file, err) in &failures {
            eprintln!("Failed {}: {:#}", file.display(), err);
        }
        bail!("{} of {} files could not be indexed", failures.len(), files.len());
    }
    Ok(())
}

/// Indexes every file it can and returns the ones that failed. Database
/// errors abort, per-file generation errors do not.
fn index_files(
    profile: &Profile,
    conn: &mut Connection,
    files: &[PathBuf],
) -> Result<Vec<(PathBuf, anyhow::Error)>> {
    let mut pending = Vec::new();
    for file in files {
        let key = file.to_string_lossy().to_string();
        if let Some(track) = db::find_track(conn, &key)? {
            println!("Skipping {} (already indexed as {})", file.display(), track);
        } else {
            pending.push((file, key));
        }
    }

    // generation runs in parallel, the database is written from this thread
    let generated: Vec<_> = pending
        .par_iter()
        .map(|(file, key)| {
            let hashes = generate_batches(profile, file).map(|batches| {
                batches
                    .into_iter()
                    .flat_map(|b| b.hashes)
                    .collect::<Vec<FingerprintHash>>()
            });
            (*file, key, hashes)
        })
        .collect();

    let mut failures = Vec::new();
    for (file, key, hashes) in generated {
        let hashes = match hashes {
            Ok(hashes) => hashes,
            Err(err) => {
                error!("skipping {}: {:#}", file.display(), err);
                failures.push((file.clone(), err));
                continue;
            }
        };
        let track = db::insert_track_record(conn, key)?;
        db::insert_fingerprints(conn, track, &hashes)?;
        println!("Indexed {} as {} ({} hashes)", key, track, hashes.len());
    }
    Ok(failures)
}

fn lookup(profile: &Profile, file: &Path, db_path: &str, all: bool) -> Result<()> {
    let conn = db::setup_database(db_path)?;
    let store = db::load_store(&conn)?;
    if store.is_empty() {
        bail!("database {db_path} holds no fingerprints, run `index` first");
    }
    let stats = store.stats();
    info!(
        "loaded {} entries under {} hashes from {} tracks",
        stats.entries, stats.hashes, stats.tracks
    );

    let source = WavSource::open(file, profile.sampling_rate)
        .with_context(|| format!("opening {}", file.display()))?;
    let (sender, receiver) = crossbeam_channel::bounded::<HashBatch>(64);
    let mut matcher = Matcher::new(&store, profile)?;

    let results = std::thread::scope(|scope| -> Result<Vec<_>> {
        let producer = scope.spawn(|| {
            FingerprintGenerator::generate(profile, source, ChannelSink::new(sender))
        });

        let mut results = Vec::new();
        for batch in &receiver {
            let decided = matcher.push_batch(&batch);
            let accepted = decided.iter().any(|r| r.verdict == Verdict::Accepted);
            results.extend(decided);
            if accepted && !all {
                break;
            }
        }
        drop(receiver);
        results.extend(matcher.finish());

        match producer.join() {
            Ok(Ok(_)) | Ok(Err(Error::SinkClosed)) => Ok(results),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => bail!("fingerprint generation panicked"),
        }
    })?;

    let accepted: Vec<_> = results
        .iter()
        .filter(|r| r.verdict == Verdict::Accepted)
        .collect();
    if accepted.is_empty() {
        println!("No match found for {}", file.display());
        return Ok(());
    }

    for result in accepted {
        let name = db::get_track_filepath(&conn, result.track)?;
        println!(
            "Match: {} at offset {:+.3} s ({} frames, {} of {} hashes, rate {:.2})",
            name,
            result.offset_seconds(profile),
            result.frames_evaluated,
            result.hash_hits,
            result.hashes_looked_up,
            result.rate
        );
    }
    Ok(())
}

fn tracks(db_path: &str) -> Result<()> {
    let conn = db::setup_database(db_path)?;
    let tracks = db::list_tracks(&conn)?;
    if tracks.is_empty() {
        println!("No tracks indexed in {db_path}");
    }
    for (track, filepath) in tracks {
        println!("{track}\t{filepath}");
    }
    Ok(())
}

fn align(profile: &Profile, files: &[PathBuf]) -> Result<()> {
    if files.len() < 2 {
        bail!("align needs at least two files");
    }

    let generated = files
        .par_iter()
        .map(|file| generate_batches(profile, file))
        .collect::<Result<Vec<_>>>()?;

    let store = FingerprintStore::new();
    let queries: Vec<(TrackId, Vec<HashBatch>)> = generated
        .into_iter()
        .enumerate()
        .map(|(i, batches)| {
            let track = TrackId(i as u32);
            for batch in &batches {
                store.add_batch(track, &batch.hashes);
            }
            (track, batches)
        })
        .collect();

    for (query, results) in matching::align_all(&store, profile, &queries)? {
        let name = files[query.0 as usize].display();
        match best_match(&results) {
            Some(m) => println!(
                "{} ~ {}: offset {:+.3} s ({} votes, rate {:.2})",
                name,
                files[m.track.0 as usize].display(),
                m.offset_seconds(profile),
                m.votes,
                m.rate
            ),
            None => {
                let inconclusive = results
                    .iter()
                    .filter(|r| r.verdict == Verdict::Inconclusive)
                    .count();
                warn!("{name}: no accepted match ({inconclusive} inconclusive candidates)");
            }
        }
    }
    Ok(())
}

fn spectrogram(profile: &Profile, file: &Path, out: &Path, spectrum: bool) -> Result<()> {
    let source = WavSource::open(file, profile.sampling_rate)
        .with_context(|| format!("opening {}", file.display()))?;
    let layer = if spectrum {
        Layer::Spectrum
    } else {
        Layer::Residual
    };

    let mut recorder = SpectrogramRecorder::new(layer);
    FingerprintGenerator::generate_observed(profile, source, landmark::Noop, &mut recorder)?;
    if recorder.save(out)? {
        println!("Spectrogram saved to {}", out.display());
    } else {
        println!("{} is shorter than one window, nothing to render", file.display());
    }
    Ok(())
}
