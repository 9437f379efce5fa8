//! Worker launch options and their command-line rendering.
//!
//! The flag surface is wide and sparse, so options live in an explicit record
//! with optional fields. The builder walks the record in declaration order,
//! which keeps the emitted flag order stable. Unknown flags a caller wants to
//! forward ride along verbatim in `extra_args`.

use serde::{Deserialize, Serialize};

/// Launch options for a worker process.
///
/// Rendering rules: a `true` boolean emits its flag alone, `false` and unset
/// fields emit nothing, scalars emit `--flag value`, and list flags emit the
/// flag once per element, except `fast`, whose values all follow a single
/// `--fast`. Two options never become flags at all: `cuda_device` and
/// `enable_metal` only derive the child environment and the device selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    // Network
    pub port: Option<u16>,
    pub listen: Option<String>,
    pub tls_keyfile: Option<String>,
    pub tls_certfile: Option<String>,

    // Directories
    pub output_directory: Option<String>,
    pub input_directory: Option<String>,
    pub temp_directory: Option<String>,
    pub user_directory: Option<String>,

    // Behavior toggles
    pub auto_launch: Option<bool>,
    pub disable_auto_launch: Option<bool>,
    pub dont_print_server: Option<bool>,
    pub multi_user: Option<bool>,
    pub windows_standalone_build: Option<bool>,

    // Hardware selection. `cuda_device` and `enable_metal` are internal:
    // they set CUDA_VISIBLE_DEVICES / PYTORCH_ENABLE_MPS_FALLBACK and the
    // device selector, never a CLI flag.
    pub cpu: Option<bool>,
    pub cuda_device: Option<u32>,
    pub enable_metal: Option<bool>,
    pub cuda_malloc: Option<bool>,
    pub disable_cuda_malloc: Option<bool>,

    // Precision selectors
    pub force_fp32: Option<bool>,
    pub force_fp16: Option<bool>,
    pub fp32_unet: Option<bool>,
    pub fp16_unet: Option<bool>,
    pub bf16_unet: Option<bool>,
    pub fp32_vae: Option<bool>,
    pub fp16_vae: Option<bool>,
    pub bf16_vae: Option<bool>,
    pub cpu_vae: Option<bool>,
    pub fp32_text_enc: Option<bool>,
    pub fp16_text_enc: Option<bool>,
    pub fp8_e4m3fn_text_enc: Option<bool>,
    pub fp8_e5m2_text_enc: Option<bool>,

    // Attention mechanism
    pub use_split_cross_attention: Option<bool>,
    pub use_quad_cross_attention: Option<bool>,
    pub use_pytorch_cross_attention: Option<bool>,
    pub use_sage_attention: Option<bool>,
    pub use_flash_attention: Option<bool>,

    // VRAM modes
    pub gpu_only: Option<bool>,
    pub highvram: Option<bool>,
    pub normalvram: Option<bool>,
    pub lowvram: Option<bool>,
    pub novram: Option<bool>,
    pub reserve_vram: Option<f64>,

    // Previews
    pub preview_method: Option<String>,
    pub preview_size: Option<u32>,

    // Caching
    pub cache_classic: Option<bool>,
    pub cache_lru: Option<u32>,
    pub cache_none: Option<bool>,

    // Optimization presets: one flag, many values.
    pub fast: Option<Vec<String>>,

    // Verbosity and metadata
    pub verbose: Option<String>,
    pub disable_metadata: Option<bool>,
    pub disable_all_custom_nodes: Option<bool>,

    // Repeated flag, once per element.
    pub extra_model_paths_config: Option<Vec<String>>,

    /// Passed through verbatim after every rendered flag.
    pub extra_args: Vec<String>,
}

impl WorkerOptions {
    /// Render the record as CLI arguments in declaration order.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        scalar(&mut args, "--port", self.port.as_ref());
        scalar(&mut args, "--listen", self.listen.as_ref());
        scalar(&mut args, "--tls-keyfile", self.tls_keyfile.as_ref());
        scalar(&mut args, "--tls-certfile", self.tls_certfile.as_ref());

        scalar(&mut args, "--output-directory", self.output_directory.as_ref());
        scalar(&mut args, "--input-directory", self.input_directory.as_ref());
        scalar(&mut args, "--temp-directory", self.temp_directory.as_ref());
        scalar(&mut args, "--user-directory", self.user_directory.as_ref());

        toggle(&mut args, "--auto-launch", self.auto_launch);
        toggle(&mut args, "--disable-auto-launch", self.disable_auto_launch);
        toggle(&mut args, "--dont-print-server", self.dont_print_server);
        toggle(&mut args, "--multi-user", self.multi_user);
        toggle(
            &mut args,
            "--windows-standalone-build",
            self.windows_standalone_build,
        );

        toggle(&mut args, "--cpu", self.cpu);
        // cuda_device and enable_metal intentionally skipped.
        toggle(&mut args, "--cuda-malloc", self.cuda_malloc);
        toggle(&mut args, "--disable-cuda-malloc", self.disable_cuda_malloc);

        toggle(&mut args, "--force-fp32", self.force_fp32);
        toggle(&mut args, "--force-fp16", self.force_fp16);
        toggle(&mut args, "--fp32-unet", self.fp32_unet);
        toggle(&mut args, "--fp16-unet", self.fp16_unet);
        toggle(&mut args, "--bf16-unet", self.bf16_unet);
        toggle(&mut args, "--fp32-vae", self.fp32_vae);
        toggle(&mut args, "--fp16-vae", self.fp16_vae);
        toggle(&mut args, "--bf16-vae", self.bf16_vae);
        toggle(&mut args, "--cpu-vae", self.cpu_vae);
        toggle(&mut args, "--fp32-text-enc", self.fp32_text_enc);
        toggle(&mut args, "--fp16-text-enc", self.fp16_text_enc);
        toggle(&mut args, "--fp8-e4m3fn-text-enc", self.fp8_e4m3fn_text_enc);
        toggle(&mut args, "--fp8-e5m2-text-enc", self.fp8_e5m2_text_enc);

        toggle(
            &mut args,
            "--use-split-cross-attention",
            self.use_split_cross_attention,
        );
        toggle(
            &mut args,
            "--use-quad-cross-attention",
            self.use_quad_cross_attention,
        );
        toggle(
            &mut args,
            "--use-pytorch-cross-attention",
            self.use_pytorch_cross_attention,
        );
        toggle(&mut args, "--use-sage-attention", self.use_sage_attention);
        toggle(&mut args, "--use-flash-attention", self.use_flash_attention);

        toggle(&mut args, "--gpu-only", self.gpu_only);
        toggle(&mut args, "--highvram", self.highvram);
        toggle(&mut args, "--normalvram", self.normalvram);
        toggle(&mut args, "--lowvram", self.lowvram);
        toggle(&mut args, "--novram", self.novram);
        scalar(&mut args, "--reserve-vram", self.reserve_vram.as_ref());

        scalar(&mut args, "--preview-method", self.preview_method.as_ref());
        scalar(&mut args, "--preview-size", self.preview_size.as_ref());

        toggle(&mut args, "--cache-classic", self.cache_classic);
        scalar(&mut args, "--cache-lru", self.cache_lru.as_ref());
        toggle(&mut args, "--cache-none", self.cache_none);

        if let Some(values) = &self.fast {
            args.push("--fast".to_string());
            args.extend(values.iter().cloned());
        }

        scalar(&mut args, "--verbose", self.verbose.as_ref());
        toggle(&mut args, "--disable-metadata", self.disable_metadata);
        toggle(
            &mut args,
            "--disable-all-custom-nodes",
            self.disable_all_custom_nodes,
        );

        if let Some(paths) = &self.extra_model_paths_config {
            for path in paths {
                args.push("--extra-model-paths-config".to_string());
                args.push(path.clone());
            }
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// The device string attributed to a worker launched with these options:
    /// a CUDA index, `mps`, or `cpu`.
    pub fn device_selector(&self) -> String {
        if let Some(index) = self.cuda_device {
            index.to_string()
        } else if self.enable_metal == Some(true) {
            "mps".to_string()
        } else {
            "cpu".to_string()
        }
    }

    /// Environment variables derived from the internal options. Everything
    /// else the child inherits from the parent.
    pub fn device_env(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        #[cfg(not(target_os = "macos"))]
        if let Some(index) = self.cuda_device {
            env.push(("CUDA_VISIBLE_DEVICES", index.to_string()));
        }
        #[cfg(target_os = "macos")]
        if self.enable_metal == Some(true) {
            env.push(("PYTORCH_ENABLE_MPS_FALLBACK", "1".to_string()));
        }
        env
    }
}

fn toggle(args: &mut Vec<String>, flag: &str, value: Option<bool>) {
    if value == Some(true) {
        args.push(flag.to_string());
    }
}

fn scalar<T: ToString>(args: &mut Vec<String>, flag: &str, value: Option<&T>) {
    if let Some(v) = value {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Inverse of `to_args` for round-trip checks: reads `--flag [values...]`
    /// groups back into a map. A flag with no following value is a boolean.
    fn parse_back(args: &[String]) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        let mut current: Option<String> = None;
        for arg in args {
            if let Some(flag) = arg.strip_prefix("--") {
                current = Some(flag.to_string());
                out.entry(flag.to_string()).or_default();
            } else if let Some(flag) = &current {
                out.get_mut(flag).expect("seen flag").push(arg.clone());
            }
        }
        out
    }

    #[test]
    fn scalar_and_bool_rendering() {
        let opts = WorkerOptions {
            port: Some(8188),
            listen: Some("0.0.0.0".into()),
            lowvram: Some(true),
            highvram: Some(false),
            disable_metadata: Some(true),
            ..Default::default()
        };
        let args = opts.to_args();
        assert_eq!(
            args,
            vec![
                "--port",
                "8188",
                "--listen",
                "0.0.0.0",
                "--lowvram",
                "--disable-metadata"
            ]
        );
    }

    #[test]
    fn fast_is_one_flag_with_trailing_values() {
        let opts = WorkerOptions {
            fast: Some(vec!["fp16_accumulation".into(), "cublas_ops".into()]),
            ..Default::default()
        };
        assert_eq!(
            opts.to_args(),
            vec!["--fast", "fp16_accumulation", "cublas_ops"]
        );
    }

    #[test]
    fn other_lists_repeat_the_flag() {
        let opts = WorkerOptions {
            extra_model_paths_config: Some(vec!["a.yaml".into(), "b.yaml".into()]),
            ..Default::default()
        };
        assert_eq!(
            opts.to_args(),
            vec![
                "--extra-model-paths-config",
                "a.yaml",
                "--extra-model-paths-config",
                "b.yaml"
            ]
        );
    }

    #[test]
    fn internal_options_never_surface_as_flags() {
        let opts = WorkerOptions {
            cuda_device: Some(1),
            enable_metal: Some(true),
            cpu: Some(true),
            ..Default::default()
        };
        let args = opts.to_args();
        assert_eq!(args, vec!["--cpu"]);
        assert!(!args.iter().any(|a| a.contains("cuda-device")));
        assert!(!args.iter().any(|a| a.contains("metal")));
    }

    #[test]
    fn extra_args_ride_along_verbatim() {
        let opts = WorkerOptions {
            port: Some(9000),
            extra_args: vec!["--some-unknown-flag".into(), "37".into()],
            ..Default::default()
        };
        assert_eq!(
            opts.to_args(),
            vec!["--port", "9000", "--some-unknown-flag", "37"]
        );
    }

    #[test]
    fn args_round_trip_modulo_internal_options() {
        let opts = WorkerOptions {
            port: Some(8190),
            listen: Some("127.0.0.1".into()),
            output_directory: Some("/srv/out".into()),
            auto_launch: Some(false),
            cpu: Some(true),
            cuda_device: Some(0),
            enable_metal: Some(true),
            reserve_vram: Some(1.5),
            preview_method: Some("latent2rgb".into()),
            cache_lru: Some(32),
            fast: Some(vec!["fp16_accumulation".into()]),
            verbose: Some("DEBUG".into()),
            extra_model_paths_config: Some(vec!["paths.yaml".into()]),
            ..Default::default()
        };

        let parsed = parse_back(&opts.to_args());
        let expected: HashMap<String, Vec<String>> = [
            ("port", vec!["8190"]),
            ("listen", vec!["127.0.0.1"]),
            ("output-directory", vec!["/srv/out"]),
            ("cpu", vec![]),
            ("reserve-vram", vec!["1.5"]),
            ("preview-method", vec!["latent2rgb"]),
            ("cache-lru", vec!["32"]),
            ("fast", vec!["fp16_accumulation"]),
            ("verbose", vec!["DEBUG"]),
            ("extra-model-paths-config", vec!["paths.yaml"]),
        ]
        .into_iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                v.into_iter().map(str::to_string).collect::<Vec<_>>(),
            )
        })
        .collect();
        // The two internal options and the false boolean vanish; everything
        // else survives the trip.
        assert_eq!(parsed, expected);
    }

    #[test]
    fn device_selector_attribution() {
        let cuda = WorkerOptions {
            cuda_device: Some(2),
            // Selector prefers an explicit CUDA index over Metal.
            enable_metal: Some(true),
            ..Default::default()
        };
        assert_eq!(cuda.device_selector(), "2");

        let metal = WorkerOptions {
            enable_metal: Some(true),
            ..Default::default()
        };
        assert_eq!(metal.device_selector(), "mps");

        assert_eq!(WorkerOptions::default().device_selector(), "cpu");
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn cuda_env_is_derived() {
        let opts = WorkerOptions {
            cuda_device: Some(3),
            ..Default::default()
        };
        assert_eq!(
            opts.device_env(),
            vec![("CUDA_VISIBLE_DEVICES", "3".to_string())]
        );
        assert!(WorkerOptions::default().device_env().is_empty());
    }
}
