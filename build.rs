use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct BuildConfig {
    application: Application,
    library: Library,
    ipc: Ipc,
    audio: Audio,
    metadata: Metadata,
    engine: Engine,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Library {
    root: String,
}

#[derive(Deserialize)]
struct Ipc {
    socket_path: String,
    channel_capacity: usize,
    request_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Audio {
    backend: String,
    playback_device: String,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
}

#[derive(Deserialize)]
struct Metadata {
    enabled: bool,
    musicbrainz_url: String,
    user_agent: String,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct Engine {
    history_limit: usize,
    default_permissions: String,
}

// Bake config.toml into the binary as compile-time environment variables.
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: BuildConfig = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    println!("cargo:rustc-env=LIBRARY_ROOT={}", config.library.root);

    println!("cargo:rustc-env=IPC_SOCKET_PATH={}", config.ipc.socket_path);
    println!("cargo:rustc-env=IPC_CHANNEL_CAPACITY={}", config.ipc.channel_capacity);
    println!("cargo:rustc-env=IPC_REQUEST_TIMEOUT_MS={}", config.ipc.request_timeout_ms);

    println!("cargo:rustc-env=AUDIO_BACKEND={}", config.audio.backend);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_PERIOD_SIZE={}", config.audio.period_size);

    println!("cargo:rustc-env=METADATA_ENABLED={}", config.metadata.enabled);
    println!("cargo:rustc-env=METADATA_MUSICBRAINZ_URL={}", config.metadata.musicbrainz_url);
    println!("cargo:rustc-env=METADATA_USER_AGENT={}", config.metadata.user_agent);
    println!("cargo:rustc-env=METADATA_TIMEOUT_MS={}", config.metadata.timeout_ms);

    println!("cargo:rustc-env=ENGINE_HISTORY_LIMIT={}", config.engine.history_limit);
    println!(
        "cargo:rustc-env=ENGINE_DEFAULT_PERMISSIONS={}",
        config.engine.default_permissions
    );
}
