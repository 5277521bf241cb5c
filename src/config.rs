use crate::engine::EngineOptions;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "adaptive-ocr-server")]
#[command(about = "OCR server driving versioned inference engines")]
#[command(version)]
pub struct Args {
    /// Host address to bind to
    #[arg(long, env = "OCR_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "OCR_PORT", default_value = "9292")]
    pub port: u16,

    /// Language used when a request does not name one (e.g., "eng", "en", "chi_sim")
    #[arg(long, env = "OCR_DEFAULT_LANGUAGE", default_value = "eng")]
    pub default_language: String,

    /// Inference engine to drive (defaults to the first compiled-in engine)
    #[arg(long, env = "OCR_ENGINE")]
    pub engine: Option<String>,

    /// Maximum decoded file size in bytes (default: 50MB)
    #[arg(long, env = "OCR_MAX_FILE_SIZE", default_value = "52428800")]
    pub max_file_size: usize,

    /// Path to tessdata directory (downloaded into the cache directory if not set)
    #[arg(long, env = "TESSDATA_PREFIX")]
    pub tessdata_path: Option<String>,

    /// CPU threads requested from engines that accept a thread count
    #[arg(long, env = "OCR_CPU_THREADS", default_value = "1")]
    pub cpu_threads: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub default_language: String,
    pub engine: Option<String>,
    pub max_file_size: usize,
    pub tessdata_path: Option<String>,
    pub cpu_threads: u16,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            default_language: args.default_language,
            engine: args.engine,
            max_file_size: args.max_file_size,
            tessdata_path: args.tessdata_path,
            cpu_threads: args.cpu_threads,
        }
    }
}

impl Config {
    /// Constructor options offered to every engine; each engine keeps the
    /// ones it declares. `lang` is added per language by the model cache.
    pub fn construction_candidates(&self) -> EngineOptions {
        let mut options = EngineOptions::new();
        options.insert("use_angle_cls".to_string(), true.into());
        options.insert("use_gpu".to_string(), false.into());
        options.insert("cpu_threads".to_string(), i64::from(self.cpu_threads).into());
        options.insert("enable_mkldnn".to_string(), false.into());
        options.insert("precision".to_string(), "fp32".into());
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OptionValue;

    #[test]
    fn test_defaults_from_empty_command_line() {
        let args = Args::try_parse_from(["adaptive-ocr-server"]).unwrap();
        let config = Config::from(args);

        assert_eq!(config.port, 9292);
        assert_eq!(config.max_file_size, 52_428_800);
        assert_eq!(config.cpu_threads, 1);
    }

    #[test]
    fn test_construction_candidates() {
        let args = Args::try_parse_from(["adaptive-ocr-server", "--cpu-threads", "4"]).unwrap();
        let candidates = Config::from(args).construction_candidates();

        assert_eq!(candidates.get("cpu_threads"), Some(&OptionValue::Int(4)));
        assert_eq!(candidates.get("precision"), Some(&OptionValue::Text("fp32".to_string())));
        assert!(!candidates.contains_key("lang"));
    }
}
