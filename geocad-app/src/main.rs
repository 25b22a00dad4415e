use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use geocad_config::{AppConfig, ConfigError};
use geocad_core::geometry::Point2;
use geocad_engine::crs::CrsRegistry;
use geocad_engine::definition;
use geocad_engine::extract::ExtractionRules;
use geocad_engine::pipeline::Pipeline;
use geocad_engine::records::{Drawing, GeoPoint, ManualAnchor, NewDrawing, SourceFile};
use geocad_io::{DocumentLoader, DxfFacade, read_source};

/// DXF 图纸地理配准与实体提取。
#[derive(Parser, Debug)]
#[command(name = "geocad", version)]
struct Cli {
    /// 配置文件路径，缺省时按 GEOCAD_CONFIG 与 ./config/default.toml 查找。
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 列出图层以及文件中的 GEODATA。
    Inspect { file: PathBuf },
    /// 配准并提取，以 JSON 输出图纸、图层与实体。
    Ingest {
        file: PathBuf,
        #[command(flatten)]
        anchor: AnchorArgs,
    },
    /// 配准后写出嵌入 GEODATA 的 DXF。
    Export {
        file: PathBuf,
        #[command(flatten)]
        anchor: AnchorArgs,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct AnchorArgs {
    /// 手动锚点纬度（度）
    #[arg(long, requires = "long", allow_negative_numbers = true)]
    lat: Option<f64>,
    /// 手动锚点经度（度）
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    long: Option<f64>,
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    design_x: f64,
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    design_y: f64,
    /// 图纸 +Y 相对正北的顺时针角（度）
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    rotation: f64,
}

impl AnchorArgs {
    fn manual(&self) -> Option<ManualAnchor> {
        let (latitude, longitude) = (self.lat?, self.long?);
        Some(ManualAnchor {
            point: GeoPoint::new(longitude, latitude),
            design_point: Point2::new(self.design_x, self.design_y),
            rotation: self.rotation,
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_configuration(cli.config.clone());
    init_logging(&config);

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "命令执行失败");
            eprintln!("错误：{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::Inspect { file } => inspect(&file),
        Command::Ingest { file, anchor } => {
            let pipeline = build_pipeline(config)?;
            let drawing = ingest(&pipeline, &file, &anchor)?;
            let store = pipeline.store();
            let layers = store.layers_of(drawing.id);
            let entities: Vec<_> = layers
                .iter()
                .flat_map(|layer| store.entities_of(layer.id))
                .collect();
            let report = json!({
                "drawing": {
                    "id": drawing.id,
                    "title": drawing.title,
                    "georef": drawing.georef,
                    "version": drawing.version,
                },
                "layers": layers,
                "entities": entities,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Export {
            file,
            anchor,
            output,
        } => {
            let pipeline = build_pipeline(config)?;
            let drawing = ingest(&pipeline, &file, &anchor)?;
            if !drawing.is_anchored() {
                warn!(file = %file.display(), "图纸未配准，输出与源文件相同");
            }
            let text = pipeline.export(drawing.id)?;
            fs::write(&output, text)
                .with_context(|| format!("写入 {} 失败", output.display()))?;
            info!(output = %output.display(), epsg = ?drawing.crs_code(), "导出完成");
            Ok(())
        }
    }
}

fn inspect(file: &Path) -> Result<()> {
    let document = DxfFacade::new()
        .load(file)
        .with_context(|| format!("读取 {} 失败", file.display()))?;
    let layers: Vec<_> = document
        .layers()
        .iter()
        .map(|layer| {
            json!({
                "name": layer.name,
                "color": layer.effective_color().to_hex(),
                "continuous": layer.is_continuous(),
            })
        })
        .collect();
    let geodata = document.geodata().map(|geodata| {
        json!({
            "epsg": definition::parse(&geodata.coordinate_system_definition).ok().map(|info| info.epsg),
            "design_point": [geodata.design_point.x(), geodata.design_point.y()],
            "reference_point": [geodata.reference_point.x(), geodata.reference_point.y()],
            "rotation": geodata.rotation_degrees(),
        })
    });
    let report = json!({
        "layers": layers,
        "entities": document.entity_count(),
        "geodata": geodata,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn ingest(pipeline: &Pipeline, file: &Path, anchor: &AnchorArgs) -> Result<Drawing> {
    let title = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "drawing".to_string());
    // 源文件只读，导出结果由调用方写到别处
    let text = read_source(file).with_context(|| format!("读取 {} 失败", file.display()))?;
    let mut request = NewDrawing::new(title, SourceFile::memory(file.display().to_string(), text));
    if let Some(manual) = anchor.manual() {
        request = request.with_manual(manual);
    }
    let drawing = pipeline
        .create(request)
        .with_context(|| format!("处理 {} 失败", file.display()))?;
    info!(
        drawing = %drawing.id,
        epsg = ?drawing.crs_code(),
        layers = pipeline.store().layers_of(drawing.id).len(),
        "图纸已处理"
    );
    Ok(drawing)
}

fn build_pipeline(config: &AppConfig) -> Result<Pipeline> {
    let registry = CrsRegistry::with_definitions(config.crs.definitions()?);
    let extraction = &config.extraction;
    let rules = ExtractionRules {
        layer_blacklist: extraction.layer_blacklist.clone(),
        name_blacklist: extraction.name_blacklist.clone(),
        approximation_distance: extraction.approximation_distance,
        max_block_depth: extraction.max_block_depth,
    };
    Ok(Pipeline::new(registry, rules))
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            eprintln!("加载指定配置 {} 失败，使用默认配置：{err}", path.display());
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                        eprintln!("加载默认配置 {} 失败，使用内建默认值：{err}", path.display());
                    }
                    ConfigError::Context { .. } | ConfigError::Invalid(_) => {
                        eprintln!("加载默认配置失败，使用内建默认值：{err}");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}
