use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use lumen_comfyui::events::GenerationEvent;
use lumen_comfyui::runner::GenerationRunner;
use lumen_core::annotation::{
    AnnotationStore, FileAnnotationStore, VisionClient, DEFAULT_ANNOTATION_PROMPT, DEFAULT_VISION_MODEL,
};
use lumen_core::dataset::{export_annotations, image_files_in, import_annotations, write_sidecar_texts};
use lumen_core::settings::{GenerationSettings, DEFAULT_SETTINGS_FILE};
use tokio::sync::broadcast::error::RecvError;

use crate::vision::OpenAiVisionClient;

const DEFAULT_ANNOTATIONS_FILE: &str = "annotations.json";

#[derive(Parser, Debug)]
#[command(name = "lumen", about = "Image generation and annotation against a ComfyUI server")]
pub struct Cli {
    /// Settings file.
    #[arg(long, global = true, env = "LUMEN_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: PathBuf,

    /// Annotation store file.
    #[arg(long, global = true, env = "LUMEN_ANNOTATIONS", default_value = DEFAULT_ANNOTATIONS_FILE)]
    pub annotations: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate one image
    Generate(GenerateArgs),

    /// Annotate images with the vision model, or store text given by hand
    Annotate(AnnotateArgs),

    /// Approve or revoke stored annotations
    Approve(ApproveArgs),

    /// Show stored annotations
    Show {
        /// Image to show; lists approved annotations when omitted.
        image: Option<PathBuf>,
    },

    /// Write approved annotations to .txt files beside their images
    ExportTxt,

    /// Dump the annotation store to a JSON file
    Export { file: PathBuf },

    /// Load annotations from a JSON export, replacing matching images
    Import { file: PathBuf },

    /// Delete stored annotations
    Remove {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Delete every stored annotation
    Clear {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Inspect or persist generation settings
    Settings(SettingsArgs),
}

/// Per-invocation overrides of the settings file.
#[derive(Args, Debug, Default)]
pub struct SettingsOverrides {
    #[arg(long)]
    pub server: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    #[arg(long)]
    pub steps: Option<u32>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Workflow JSON file (API format).
    #[arg(long)]
    pub workflow: Option<PathBuf>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Completion deadline in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Prompt text.
    #[arg(required_unless_present = "from_annotation", conflicts_with = "from_annotation")]
    pub prompt: Option<String>,

    /// Use the stored annotation of this image as the prompt.
    #[arg(long)]
    pub from_annotation: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: SettingsOverrides,
}

#[derive(Args, Debug)]
pub struct AnnotateArgs {
    /// Image files, or folders whose images are annotated in turn.
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    #[arg(long, default_value = DEFAULT_VISION_MODEL)]
    pub model: String,

    /// Instruction sent with each image.
    #[arg(long)]
    pub prompt: Option<String>,

    /// Store this text instead of asking the vision model.
    #[arg(long, conflicts_with = "prompt")]
    pub text: Option<String>,
}

#[derive(Args, Debug)]
pub struct ApproveArgs {
    #[arg(required_unless_present = "all")]
    pub images: Vec<PathBuf>,

    /// Approve every stored annotation.
    #[arg(long, conflicts_with_all = ["images", "revoke"])]
    pub all: bool,

    /// Withdraw approval instead.
    #[arg(long)]
    pub revoke: bool,
}

#[derive(Args, Debug)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub command: SettingsCommands,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Print the effective settings
    Show(SettingsOverrides),
    /// Apply overrides and write the settings file
    Save(SettingsOverrides),
}

impl SettingsOverrides {
    pub fn apply(self, settings: &mut GenerationSettings) -> anyhow::Result<()> {
        if let Some(server) = self.server {
            settings.server = server;
        }
        if let Some(model) = self.model {
            settings.model = model;
        }
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(steps) = self.steps {
            settings.steps = steps;
        }
        if self.seed.is_some() {
            settings.seed = self.seed;
        }
        if let Some(path) = self.workflow {
            settings.workflow = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read workflow {}", path.display()))?;
            // Bindings saved for another workflow would point at the wrong nodes.
            settings.bindings = None;
        }
        if let Some(dir) = self.output_dir {
            settings.output_dir = dir;
        }
        if let Some(secs) = self.timeout_secs {
            settings.timeout_secs = secs;
        }
        Ok(())
    }
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Generate(args) => generate(&cli.settings, &cli.annotations, args).await,
        Commands::Annotate(args) => annotate(&cli.annotations, args).await,
        Commands::Approve(args) => approve(&cli.annotations, args),
        Commands::Show { image } => show(&cli.annotations, image),
        Commands::ExportTxt => export_txt(&cli.annotations),
        Commands::Export { file } => {
            let store = FileAnnotationStore::open(&cli.annotations)?;
            let count = export_annotations(&store, &file)?;
            println!("Exported {count} annotations to {}", file.display());
            Ok(())
        }
        Commands::Import { file } => {
            let mut store = FileAnnotationStore::open(&cli.annotations)?;
            let count = import_annotations(&mut store, &file)?;
            println!("Imported {count} annotations from {}", file.display());
            Ok(())
        }
        Commands::Remove { images } => remove(&cli.annotations, &images),
        Commands::Clear { yes } => clear(&cli.annotations, yes),
        Commands::Settings(args) => settings(&cli.settings, args),
    }
}

fn load_settings(path: &Path, overrides: SettingsOverrides) -> anyhow::Result<GenerationSettings> {
    let mut settings = GenerationSettings::load(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    overrides.apply(&mut settings)?;
    settings.validate()?;
    Ok(settings)
}

fn image_key(path: &Path) -> String {
    path.display().to_string()
}

async fn generate(settings_path: &Path, annotations: &Path, args: GenerateArgs) -> anyhow::Result<()> {
    let settings = load_settings(settings_path, args.overrides)?;

    let prompt = match (args.prompt, args.from_annotation) {
        (Some(prompt), _) => prompt,
        (None, Some(image)) => {
            let store = FileAnnotationStore::open(annotations)?;
            match store.lookup(&image_key(&image)) {
                Some(record) => record.text,
                None => bail!("No annotation stored for {}", image.display()),
            }
        }
        (None, None) => bail!("A prompt or --from-annotation is required"),
    };

    let runner = GenerationRunner::new(settings);
    let mut events = runner.subscribe();
    let handle = runner.start(runner.settings().params_for(prompt))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, cancelling generation");
                handle.cancel();
            }
            event = events.recv() => match event {
                Ok(GenerationEvent::Submitted { prompt_id, queue_position, .. }) => {
                    println!("Queued {prompt_id} at position {queue_position}");
                }
                Ok(GenerationEvent::Finished { .. } | GenerationEvent::Failed { .. }) => break,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }

    let artifact = handle.wait().await.context("Generation failed")?;
    println!("{}", artifact.path.display());
    Ok(())
}

async fn annotate(annotations: &Path, args: AnnotateArgs) -> anyhow::Result<()> {
    let images = expand_images(&args.images)?;
    let mut store = FileAnnotationStore::open(annotations)?;

    if let Some(text) = &args.text {
        for image in &images {
            store.upsert(&image_key(image), text)?;
        }
        println!("Stored annotation for {} images", images.len());
        return Ok(());
    }

    let client = OpenAiVisionClient::from_env()?;
    let prompt = args.prompt.as_deref().unwrap_or(DEFAULT_ANNOTATION_PROMPT);
    let failures = annotate_with(&client, &mut store, &images, prompt, &args.model).await?;

    if failures > 0 {
        bail!("{failures} of {} images failed to annotate", images.len());
    }
    Ok(())
}

/// Replace each folder argument by the images directly inside it.
fn expand_images(args: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for path in args {
        if path.is_dir() {
            let found = image_files_in(path)?;
            tracing::info!(folder = %path.display(), count = found.len(), "Annotating folder");
            images.extend(found);
        } else {
            images.push(path.clone());
        }
    }
    Ok(images)
}

/// Ask `client` about each image in turn. A failed image is logged and
/// skipped; store write failures abort. Returns the failure count.
async fn annotate_with(
    client: &impl VisionClient,
    store: &mut impl AnnotationStore,
    images: &[PathBuf],
    prompt: &str,
    model: &str,
) -> anyhow::Result<usize> {
    let mut failures = 0usize;
    for (done, image) in images.iter().enumerate() {
        match client.request(image, prompt, model).await {
            Ok(text) => {
                store.upsert(&image_key(image), &text)?;
                tracing::info!(
                    image = %image.display(),
                    progress = format!("{}/{}", done + 1, images.len()),
                    "Annotation stored",
                );
                println!("{}: {text}", image.display());
            }
            Err(e) => {
                failures += 1;
                tracing::error!(image = %image.display(), error = %e, "Annotation failed");
            }
        }
    }
    Ok(failures)
}

fn approve(annotations: &Path, args: ApproveArgs) -> anyhow::Result<()> {
    let mut store = FileAnnotationStore::open(annotations)?;

    if args.all {
        let count = store.approve_all()?;
        println!("Approved {count} annotations");
        return Ok(());
    }

    for image in &args.images {
        if !store.set_approved(&image_key(image), !args.revoke)? {
            bail!("No annotation stored for {}", image.display());
        }
    }
    Ok(())
}

fn show(annotations: &Path, image: Option<PathBuf>) -> anyhow::Result<()> {
    let store = FileAnnotationStore::open(annotations)?;

    match image {
        Some(image) => {
            let Some(record) = store.lookup(&image_key(&image)) else {
                bail!("No annotation stored for {}", image.display());
            };
            let state = if record.approved { "approved" } else { "pending" };
            println!("[{state}] {}", record.text);
        }
        None => {
            for (key, text) in store.approved() {
                println!("{key}: {text}");
            }
        }
    }
    Ok(())
}

fn export_txt(annotations: &Path) -> anyhow::Result<()> {
    let store = FileAnnotationStore::open(annotations)?;
    let report = write_sidecar_texts(&store);
    println!("Wrote {} caption files", report.written.len());
    for (image, reason) in &report.failed {
        eprintln!("{image}: {reason}");
    }
    Ok(())
}

fn remove(annotations: &Path, images: &[PathBuf]) -> anyhow::Result<()> {
    let mut store = FileAnnotationStore::open(annotations)?;
    let mut missing = Vec::new();
    for image in images {
        if !store.remove(&image_key(image))? {
            missing.push(image.display().to_string());
        }
    }
    if !missing.is_empty() {
        bail!("No annotation stored for {}", missing.join(", "));
    }
    Ok(())
}

fn clear(annotations: &Path, confirmed: bool) -> anyhow::Result<()> {
    if !confirmed {
        bail!("Refusing to delete every annotation without --yes");
    }
    let mut store = FileAnnotationStore::open(annotations)?;
    let count = store.clear()?;
    println!("Deleted {count} annotations");
    Ok(())
}

fn settings(path: &Path, args: SettingsArgs) -> anyhow::Result<()> {
    match args.command {
        SettingsCommands::Show(overrides) => {
            let settings = load_settings(path, overrides)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsCommands::Save(overrides) => {
            let settings = load_settings(path, overrides)?;
            settings.save(path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::error::CoreError;

    #[test]
    fn overrides_replace_only_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = dir.path().join("wf.json");
        std::fs::write(&workflow, r#"{"3": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}}}"#)
            .unwrap();

        let mut settings = GenerationSettings {
            model: "keep.safetensors".into(),
            bindings: Some(Default::default()),
            ..Default::default()
        };
        SettingsOverrides {
            width: Some(1024),
            seed: Some(7),
            workflow: Some(workflow),
            ..Default::default()
        }
        .apply(&mut settings)
        .unwrap();

        assert_eq!(settings.width, 1024);
        assert_eq!(settings.height, 512);
        assert_eq!(settings.seed, Some(7));
        assert_eq!(settings.model, "keep.safetensors");
        assert!(settings.workflow.contains("CLIPTextEncode"));
        assert!(settings.bindings.is_none());
    }

    #[test]
    fn generate_requires_prompt_or_annotation() {
        assert!(Cli::try_parse_from(["lumen", "generate"]).is_err());
        assert!(Cli::try_parse_from(["lumen", "generate", "a fox"]).is_ok());
        assert!(Cli::try_parse_from(["lumen", "generate", "--from-annotation", "a.png"]).is_ok());
        assert!(Cli::try_parse_from(["lumen", "generate", "a fox", "--from-annotation", "a.png"]).is_err());
    }

    #[test]
    fn approve_all_conflicts_with_images() {
        assert!(Cli::try_parse_from(["lumen", "approve", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["lumen", "approve", "--all", "a.png"]).is_err());
        assert!(Cli::try_parse_from(["lumen", "approve"]).is_err());
    }

    struct CannedVision;

    #[async_trait::async_trait]
    impl VisionClient for CannedVision {
        async fn request(&self, image_path: &Path, prompt: &str, _model: &str) -> Result<String, CoreError> {
            match image_path.file_stem().and_then(|s| s.to_str()) {
                Some("broken") => Err(CoreError::Internal("vision backend down".into())),
                Some(stem) => Ok(format!("{prompt}: {stem}")),
                None => Err(CoreError::Validation("no file name".into())),
            }
        }
    }

    async fn run_against(db: &Path, command: &str, file: &Path) -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "lumen",
            "--annotations",
            db.to_str().unwrap(),
            command,
            file.to_str().unwrap(),
        ])
        .unwrap();
        execute(cli).await
    }

    fn parse(args: &[&str]) -> Commands {
        Cli::try_parse_from(args).unwrap().command
    }

    #[tokio::test]
    async fn folder_annotation_skips_failures_and_stores_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "broken.jpg", "c.bmp", "readme.md"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let mut store = FileAnnotationStore::open(dir.path().join("db.json")).unwrap();

        let images = expand_images(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(images.len(), 3);
        let failures = annotate_with(&CannedVision, &mut store, &images, "describe", "m")
            .await
            .unwrap();

        assert_eq!(failures, 1);
        assert_eq!(store.len(), 2);
        let a = store.lookup(&image_key(&dir.path().join("a.png"))).unwrap();
        assert_eq!(a.text, "describe: a");
        assert!(a.is_new);
    }

    #[tokio::test]
    async fn manual_text_is_stored_without_vision_model() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db.json");
        let image = dir.path().join("fox.png");
        let Commands::Annotate(args) = parse(&[
            "lumen",
            "annotate",
            "--text",
            "gsai, illustration. A fox at dusk.",
            image.to_str().unwrap(),
        ]) else {
            panic!("expected annotate command");
        };

        annotate(&db, args).await.unwrap();

        let record = FileAnnotationStore::open(&db).unwrap().lookup(&image_key(&image)).unwrap();
        assert_eq!(record.text, "gsai, illustration. A fox at dusk.");
        assert!(!record.approved);
        assert!(Cli::try_parse_from(["lumen", "annotate", "--text", "t", "--prompt", "p", "a.png"]).is_err());
    }

    #[test]
    fn remove_and_clear_commands() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db.json");
        let mut store = FileAnnotationStore::open(&db).unwrap();
        for key in ["a.png", "b.png", "c.png"] {
            store.upsert(key, "text").unwrap();
        }

        remove(&db, &[PathBuf::from("a.png")]).unwrap();
        assert!(remove(&db, &[PathBuf::from("a.png")]).is_err());
        assert_eq!(FileAnnotationStore::open(&db).unwrap().len(), 2);

        assert!(clear(&db, false).is_err());
        assert_eq!(FileAnnotationStore::open(&db).unwrap().len(), 2);
        clear(&db, true).unwrap();
        assert!(FileAnnotationStore::open(&db).unwrap().is_empty());

        assert!(matches!(parse(&["lumen", "clear", "--yes"]), Commands::Clear { yes: true }));
        assert!(Cli::try_parse_from(["lumen", "remove"]).is_err());
    }

    #[test]
    fn export_txt_writes_approved_captions() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db.json");
        let image = dir.path().join("owl.png");
        let mut store = FileAnnotationStore::open(&db).unwrap();
        store.upsert(&image_key(&image), "an owl").unwrap();
        store.set_approved(&image_key(&image), true).unwrap();
        assert!(matches!(parse(&["lumen", "export-txt"]), Commands::ExportTxt));

        export_txt(&db).unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("owl.txt")).unwrap(), "an owl");
    }

    #[tokio::test]
    async fn export_then_import_commands() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.json");
        let target = dir.path().join("target.json");
        let dump = dir.path().join("dump.json");
        FileAnnotationStore::open(&source).unwrap().upsert("a.png", "ant").unwrap();

        run_against(&source, "export", &dump).await.unwrap();
        run_against(&target, "import", &dump).await.unwrap();

        let imported = FileAnnotationStore::open(&target).unwrap();
        assert_eq!(imported.lookup("a.png").unwrap().text, "ant");
    }

    #[test]
    fn settings_save_round_trips_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let cli = Cli::try_parse_from([
            "lumen",
            "--settings",
            path.to_str().unwrap(),
            "settings",
            "save",
            "--server",
            "http://gpu-box:8188",
            "--steps",
            "30",
        ])
        .unwrap();
        let Commands::Settings(args) = cli.command else {
            panic!("expected settings command");
        };

        settings(&path, args).unwrap();

        let saved = GenerationSettings::load(&path).unwrap();
        assert_eq!(saved.server, "http://gpu-box:8188");
        assert_eq!(saved.steps, 30);
    }
}
