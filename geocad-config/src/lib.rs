use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// 指向配置文件的环境变量。
pub const CONFIG_ENV: &str = "GEOCAD_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub crs: CrsConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 自动发现配置文件：优先读取环境变量 `GEOCAD_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let distance = self.extraction.approximation_distance;
        if !(distance.is_finite() && distance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "extraction.approximation_distance 必须为正数（当前 {distance}）"
            )));
        }
        self.crs.definitions().map(|_| ())
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 实体提取的过滤与离散参数。
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "ExtractionConfig::default_layer_blacklist")]
    pub layer_blacklist: Vec<String>,
    #[serde(default = "ExtractionConfig::default_name_blacklist")]
    pub name_blacklist: Vec<String>,
    #[serde(default = "ExtractionConfig::default_approximation_distance")]
    pub approximation_distance: f64,
    #[serde(default = "ExtractionConfig::default_max_block_depth")]
    pub max_block_depth: usize,
}

impl ExtractionConfig {
    fn default_layer_blacklist() -> Vec<String> {
        vec!["Defpoints".to_string()]
    }

    fn default_name_blacklist() -> Vec<String> {
        vec!["*Model_Space".to_string(), "DynamicInputDot".to_string()]
    }

    fn default_approximation_distance() -> f64 {
        0.1
    }

    fn default_max_block_depth() -> usize {
        8
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            layer_blacklist: Self::default_layer_blacklist(),
            name_blacklist: Self::default_name_blacklist(),
            approximation_distance: Self::default_approximation_distance(),
            max_block_depth: Self::default_max_block_depth(),
        }
    }
}

/// 额外的坐标系定义：EPSG 代码 → proj 字符串。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrsConfig {
    #[serde(default)]
    definitions: BTreeMap<String, String>,
}

impl CrsConfig {
    pub fn definitions(&self) -> Result<BTreeMap<u32, String>, ConfigError> {
        self.definitions
            .iter()
            .map(|(code, proj)| {
                code.trim()
                    .parse::<u32>()
                    .map(|code| (code, proj.clone()))
                    .map_err(|_| ConfigError::Invalid(format!("crs.definitions 中的 EPSG 代码 {code:?} 无效")))
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("配置无效: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_returned_when_file_missing() {
        let cfg = AppConfig::discover().expect("discover should succeed");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.extraction.layer_blacklist, ["Defpoints"]);
        assert_eq!(cfg.extraction.name_blacklist, ["*Model_Space", "DynamicInputDot"]);
        assert!((cfg.extraction.approximation_distance - 0.1).abs() < f64::EPSILON);
        assert_eq!(cfg.extraction.max_block_depth, 8);
        assert!(cfg.crs.definitions().expect("definitions").is_empty());
    }

    #[test]
    fn load_from_temp_file() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(
            file,
            r#"
            [logging]
            level = "debug"

            [extraction]
            layer_blacklist = ["Defpoints", "Hidden"]
            approximation_distance = 0.5

            [crs.definitions]
            3003 = "+proj=tmerc +lat_0=0 +lon_0=9 +k=0.9996 +x_0=1500000 +y_0=0 +ellps=intl +units=m"
            "#
        )
        .unwrap();

        let cfg = AppConfig::from_file(file.path()).expect("load config");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.extraction.layer_blacklist.len(), 2);
        assert_eq!(cfg.extraction.name_blacklist.len(), 2);
        assert!((cfg.extraction.approximation_distance - 0.5).abs() < f64::EPSILON);
        let definitions = cfg.crs.definitions().expect("definitions");
        assert!(definitions[&3003].starts_with("+proj=tmerc"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(
            file,
            r#"
            [extraction]
            approximation_distance = 0.0
            "#
        )
        .unwrap();
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(
            file,
            r#"
            [crs.definitions]
            UTM = "+proj=utm +zone=33"
            "#
        )
        .unwrap();
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = AppConfig::from_file("/nonexistent/geocad.toml").expect_err("should fail");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
