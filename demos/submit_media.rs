//! Submit one media file and wait for its analysis.
//!
//! ```text
//! cargo run --example submit_media -- meal.mp4 [http://localhost:3000]
//! ```

use std::path::Path;
use std::time::Duration;

use media_pipeline::client::{ExponentialBackoff, PipelineClient, PollOutcome};
use media_pipeline::services::coordinator::normalize_content_type;
use tracing_subscriber::EnvFilter;

fn guess_content_type(path: &Path) -> Option<&'static str> {
    let declared = match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => return None,
    };
    normalize_content_type(declared).map(|(ct, _)| ct)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("usage: submit_media <file> [base_url]")?;
    let base_url = args.next().unwrap_or_else(|| "http://localhost:3000".to_string());

    let path = Path::new(&path);
    let content_type = guess_content_type(path).ok_or("unsupported file extension")?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or("file name is not valid UTF-8")?;
    let data = std::fs::read(path)?;

    let client = PipelineClient::new(&base_url);
    let strategy = ExponentialBackoff {
        initial: Duration::from_secs(1),
        factor: 1.5,
        max_delay: Duration::from_secs(20),
        max_attempts: 90,
    };

    match client.submit(filename, content_type, data, &strategy).await? {
        PollOutcome::Completed(results) => {
            println!("Job {} completed", results.job_id);
            if let Some(summary) = &results.nutrition_summary {
                println!(
                    "  {} food items, {:.0} kcal, {:.0} g",
                    summary.num_food_items, summary.total_calories_kcal, summary.total_mass_g
                );
            }
            for food in &results.detected_foods {
                println!("  - {} ({:?} kcal)", food.name, food.calories_kcal);
            }
            if let Some(url) = &results.download_url {
                let document = client.fetch_result_document(url).await?;
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
        }
        PollOutcome::Failed { job_id, error } => {
            eprintln!("Job {} failed: {}", job_id, error);
            eprintln!("Resubmit the file to try again.");
            std::process::exit(1);
        }
        PollOutcome::TimedOut { job_id, last_status } => {
            eprintln!(
                "Job {} still {} after polling; check again later with GET /status/{}",
                job_id, last_status, job_id
            );
            std::process::exit(3);
        }
    }
    Ok(())
}
