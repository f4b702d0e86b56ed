//! Render target pool and view buffer integration tests.
//!
//! - **Pool Tests**: descriptor identity, reuse and aging flushes
//! - **Render Buffer Tests**: G-Buffer formats and resize behavior

mod common;

use rstest::rstest;

use common::{basic_scene, camera, render_frame, renderer};
use deferred_renderer::backend::{RecordingDevice, TextureDescriptor, TextureFlags, TextureFormat};
use deferred_renderer::resources::{RenderBuffers, RenderTargetPool, GBUFFER_FORMATS, LAZY_RELEASE_FRAMES};
use deferred_renderer::scene::PostProcessSettings;

fn color_flags() -> TextureFlags {
    TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET
}

// ============================================================================
// Pool Tests
// ============================================================================

/// A pooled texture always carries exactly the requested descriptor, and
/// released textures come back only for an identical descriptor.
#[rstest]
#[case::color(TextureDescriptor::new_2d(64, 32, TextureFormat::Rgba16Float, color_flags()))]
#[case::mipped(TextureDescriptor::new_2d(64, 32, TextureFormat::Rgba16Float, color_flags()).with_mips(4))]
#[case::uav(TextureDescriptor::new_2d(
    64,
    32,
    TextureFormat::Rgba16Float,
    color_flags() | TextureFlags::UNORDERED_ACCESS
))]
#[case::cube(TextureDescriptor::new_cube(32, TextureFormat::Rgba16Float, color_flags(), 4))]
fn test_pool_returns_matching_descriptor(#[case] desc: TextureDescriptor) {
    common::init_logging();
    let mut device = RecordingDevice::new();
    let pool = RenderTargetPool::new();

    let first = pool.get(&mut device, "Target", &desc).unwrap();
    assert_eq!(first.desc, desc);
    pool.release(first);

    // A descriptor differing in one field must not reuse the free entry
    let mut other = desc;
    other.mip_levels += 1;
    let different = pool.get(&mut device, "Other", &other).unwrap();
    assert_eq!(different.desc, other);
    assert_ne!(different.handle, first.handle);

    let again = pool.get(&mut device, "Target", &desc).unwrap();
    assert_eq!(again.handle, first.handle);
    assert_eq!(again.desc, desc);
    assert_eq!(pool.stats().reuses, 1);

    pool.release(different);
    pool.release(again);
    assert_eq!(pool.stats().in_use, 0);
}

#[rstest]
#[case::fresh(0, 3, false)]
#[case::just_below(2, 3, false)]
#[case::at_limit(3, 3, true)]
#[case::old(10, 3, true)]
#[case::keep_zero(0, 0, true)]
fn test_pool_flush_by_age(#[case] idle_frames: u64, #[case] keep_frames: u64, #[case] destroyed: bool) {
    let mut device = RecordingDevice::new();
    let pool = RenderTargetPool::new();
    let desc = TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8Unorm, color_flags());

    pool.set_frame(5);
    let texture = pool.get(&mut device, "Aging", &desc).unwrap();
    pool.release(texture);
    pool.set_frame(5 + idle_frames);
    pool.flush(&mut device, false, keep_frames);

    assert_eq!(device.is_texture_alive(texture.handle), !destroyed);
    assert_eq!(pool.stats().free, usize::from(!destroyed));
}

#[test]
fn test_pool_flush_keeps_textures_in_use() {
    let mut device = RecordingDevice::new();
    let pool = RenderTargetPool::new();
    let desc = TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8Unorm, color_flags());
    let held = pool.get(&mut device, "Held", &desc).unwrap();

    pool.set_frame(100);
    pool.flush(&mut device, true, 0);
    assert!(device.is_texture_alive(held.handle));
    assert!(pool.is_in_use(&held));
    pool.release(held);
}

// ============================================================================
// Render Buffer Tests
// ============================================================================

/// The four G-Buffer targets use fixed formats and are sampleable render targets
#[rstest]
#[case::hd(1920, 1080)]
#[case::small(64, 64)]
#[case::odd(333, 177)]
fn test_gbuffer_formats(#[case] width: u32, #[case] height: u32) {
    let mut device = RecordingDevice::new();
    let pool = RenderTargetPool::new();
    let mut buffers = RenderBuffers::new();
    assert!(buffers.init(&mut device, &pool, width, height).unwrap());

    for (index, format) in GBUFFER_FORMATS.iter().enumerate() {
        let texture = buffers.gbuffer(index).copied().unwrap();
        assert_eq!(texture.desc.format, *format, "GBuffer{index}");
        assert_eq!((texture.desc.width, texture.desc.height), (width, height));
        assert!(texture.desc.flags.contains(color_flags()));
    }
    let depth = buffers.depth_buffer().copied().unwrap();
    assert!(depth.desc.flags.contains(TextureFlags::DEPTH_STENCIL | TextureFlags::SHADER_RESOURCE));
    buffers.release(&mut device, &pool);
}

/// Same size keeps every target, a new size recreates them and
/// flushes the pool.
#[test]
fn test_resize_reallocates_and_flushes() {
    let mut device = RecordingDevice::new();
    let pool = RenderTargetPool::new();
    let mut buffers = RenderBuffers::new();

    assert!(buffers.init(&mut device, &pool, 1920, 1080).unwrap());
    let before: Vec<_> = (0..4).map(|i| buffers.gbuffer(i).copied().unwrap()).collect();
    let depth_before = buffers.depth_buffer().copied().unwrap();
    let flushes = pool.stats().flushes;

    assert!(!buffers.init(&mut device, &pool, 1920, 1080).unwrap());
    assert_eq!(pool.stats().flushes, flushes);
    assert_eq!(buffers.depth_buffer().copied(), Some(depth_before));

    // An idle pooled texture older than the lazy release window goes away
    let stale_desc = TextureDescriptor::new_2d(8, 8, TextureFormat::Rgba8Unorm, color_flags());
    let stale = pool.get(&mut device, "Stale", &stale_desc).unwrap();
    pool.release(stale);
    pool.set_frame(LAZY_RELEASE_FRAMES);

    assert!(buffers.init(&mut device, &pool, 1280, 720).unwrap());
    assert_eq!(pool.stats().flushes, flushes + 1);
    assert!(!device.is_texture_alive(stale.handle));
    for (index, old) in before.iter().enumerate() {
        let new = buffers.gbuffer(index).copied().unwrap();
        assert_ne!(new.handle, old.handle);
        assert_eq!((new.desc.width, new.desc.height), (1280, 720));
        assert!(!device.is_texture_alive(old.handle));
    }
    let depth = buffers.depth_buffer().copied().unwrap();
    assert_ne!(depth.handle, depth_before.handle);
    assert_eq!((depth.desc.width, depth.desc.height), (1280, 720));
    buffers.release(&mut device, &pool);
}

#[test]
fn test_renderer_reports_resize() {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let settings = PostProcessSettings::default();
    let id = renderer.create_view();

    let view = camera(&renderer, 160, 90);
    assert!(render_frame(&mut renderer, &mut scene, id, view, &settings).resized);
    let view = camera(&renderer, 160, 90);
    let report = render_frame(&mut renderer, &mut scene, id, view, &settings);
    assert!(!report.resized);
    assert_eq!((report.output.desc.width, report.output.desc.height), (160, 90));

    let view = camera(&renderer, 128, 72);
    let report = render_frame(&mut renderer, &mut scene, id, view, &settings);
    assert!(report.resized);
    assert_eq!((report.output.desc.width, report.output.desc.height), (128, 72));
    assert_eq!(renderer.view_buffers(id).unwrap().size(), (128, 72));
    assert_eq!(renderer.device().find_textures("GBuffer0").len(), 1);
}
