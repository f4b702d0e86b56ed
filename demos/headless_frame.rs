//! # Headless Frame Demo
//!
//! Renders a small scene on the recording backend and prints what every
//! frame recorded:
//! - Passes executed and skipped
//! - GPU commands per top level event
//! - Render target pool statistics
//!
//! ```bash
//! cargo run --example headless_frame -- --frames 4 --width 640 --height 360
//! RUST_LOG=debug cargo run --example headless_frame -- --config renderer.toml
//! ```

use std::path::PathBuf;

use clap::Parser;
use glam::Vec3;

use deferred_renderer::backend::{GpuCommand, RecordingContext, RecordingDevice};
use deferred_renderer::render_graph::PassKind;
use deferred_renderer::resources::{GpuMesh, Mesh};
use deferred_renderer::scene::{
    DirectionalLight, EnvironmentProbe, ExponentialHeightFog, MaterialInfo, PointLight, PostProcessSettings,
    ProbeKind, Scene, StaticModel, Transform, VolumetricFogOptions,
};
use deferred_renderer::{Renderer, RendererConfig};

#[derive(Debug, Parser)]
#[command(name = "headless_frame", about = "Record deferred renderer frames without a GPU")]
struct Args {
    /// Number of frames to render
    #[arg(long, default_value_t = 3)]
    frames: u64,

    /// View width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// View height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Renderer configuration in TOML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable the global surface atlas
    #[arg(long)]
    gi: bool,

    /// Queue an environment probe bake on the first frame
    #[arg(long)]
    bake_probe: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<RendererConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(RendererConfig::default());
    };
    let source = std::fs::read_to_string(path)?;
    Ok(RendererConfig::from_toml_str(&source)?)
}

fn build_scene(device: &mut RecordingDevice) -> Result<Scene, Box<dyn std::error::Error>> {
    let cube = GpuMesh::upload(device, &Mesh::cube())?;
    let mut scene = Scene::new();

    scene.spawn_model(
        Transform::from_position_scale(Vec3::new(0.0, -60.0, -500.0), Vec3::new(2000.0, 10.0, 2000.0)),
        StaticModel::new(cube, MaterialInfo::default()),
    );
    for i in 0..5 {
        let x = (i as f32 - 2.0) * 150.0;
        scene.spawn_model(
            Transform::from_position_scale(Vec3::new(x, 0.0, -400.0), Vec3::splat(60.0)),
            StaticModel::new(cube, MaterialInfo::default()).dynamic(),
        );
    }

    scene.spawn_directional_light(Vec3::new(-0.4, -1.0, -0.3).normalize(), DirectionalLight::default());
    scene.spawn_point_light(
        Vec3::new(0.0, 120.0, -350.0),
        PointLight {
            radius: 600.0,
            ..Default::default()
        },
    );
    scene.spawn_fog(
        -50.0,
        ExponentialHeightFog {
            volumetric: Some(VolumetricFogOptions::default()),
            ..Default::default()
        },
    );
    Ok(scene)
}

fn pass_names(kinds: &[PassKind]) -> String {
    kinds.iter().map(|kind| kind.name()).collect::<Vec<_>>().join(", ")
}

/// Command counts per top level event
fn event_summary(commands: &[GpuCommand]) -> Vec<(String, usize)> {
    let mut summary: Vec<(String, usize)> = Vec::new();
    let mut depth = 0usize;
    for command in commands {
        match command {
            GpuCommand::PushEvent(name) => {
                depth += 1;
                // Depth 2 sits right under the frame event
                if depth == 2 {
                    summary.push((name.clone(), 0));
                }
            }
            GpuCommand::PopEvent => depth = depth.saturating_sub(1),
            _ => {
                if depth >= 2 {
                    if let Some(last) = summary.last_mut() {
                        last.1 += 1;
                    }
                }
            }
        }
    }
    summary
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;
    log::info!("Config:\n{}", config.to_toml_string()?);

    let mut device = RecordingDevice::new();
    let mut scene = build_scene(&mut device)?;
    let probe = scene.spawn_environment_probe(Vec3::new(0.0, 100.0, -400.0), EnvironmentProbe::default());

    let mut renderer = Renderer::new(device, RecordingContext::new(), config);
    let view_id = renderer.create_view();
    let mut settings = PostProcessSettings::default();
    settings.global_illumination.enabled = args.gi;
    if args.bake_probe {
        renderer.bake_probe(ProbeKind::EnvProbe, probe, 0.0);
    }

    for frame in 0..args.frames {
        renderer.context_mut().clear();
        renderer.begin_frame(1.0 / 60.0);

        let mut view = renderer.new_view(args.width, args.height);
        let orbit = frame as f32 * 0.05;
        let position = Vec3::new(orbit.sin() * 200.0, 80.0, orbit.cos() * 200.0);
        view.set_perspective(
            position,
            (Vec3::new(0.0, 0.0, -400.0) - position).normalize(),
            Vec3::Y,
            1.2,
            10.0,
            10000.0,
        );

        let report = renderer.render(&mut scene, view_id, view, &settings)?;
        renderer.end_frame(&mut scene);

        log::info!(
            "Frame {}: {} commands, {} draws{}",
            report.frame_index,
            renderer.context().commands().len(),
            renderer.context().draw_count(),
            if report.resized { " (resized)" } else { "" }
        );
        log::info!("  executed: {}", pass_names(&report.executed));
        if !report.skipped.is_empty() {
            log::info!("  skipped: {}", pass_names(&report.skipped));
        }
        for (event, count) in event_summary(renderer.context().commands()) {
            log::info!("  {event:<24} {count}");
        }
    }

    let stats = renderer.pool().stats();
    log::info!(
        "Pool: {} allocations, {} reuses, {} destroyed, {} free",
        stats.allocations,
        stats.reuses,
        stats.destroyed,
        stats.free
    );
    if args.bake_probe {
        log::info!("Probes baked: {}", renderer.probes().bakes_completed());
    }

    renderer.dispose();
    Ok(())
}
