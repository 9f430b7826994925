//! Runs a few hundred frames against the headless backend, recording passes
//! from several threads and letting the emulated GPU fall behind.
//!
//! `RUST_LOG=graphics=trace cargo run --example frame_loop` shows the frame
//! loop waiting on the GPU and reclaiming ring allocations.

use graphics::{
    Color, DescriptorHeapKind, DeviceConfig, GraphicsDevice, HeadlessBackend, QueueKind,
};

const FRAMES: u64 = 240;
const PASSES: u32 = 4;

#[derive(Clone, Copy)]
#[repr(C)]
struct PassConstants {
    frame: u64,
    pass: u32,
    tint: [f32; 4],
}

fn main() {
    env_logger::init();

    let config = DeviceConfig {
        upload_ring_size: 64 * 1024,
        online_descriptor_count: 1024,
        ..DeviceConfig::default()
    };

    let backend = HeadlessBackend::new(config.backbuffer_count, 1280, 720);
    let mut device = match GraphicsDevice::new(backend, &config) {
        Ok(device) => device,
        Err(error) => {
            log::error!("failed to create device: {error}");
            std::process::exit(1);
        }
    };

    // long-lived texture views, copied into the online ring every frame
    let textures: Vec<_> = (0..PASSES)
        .map(|_| device.allocate_offline_descriptor(DescriptorHeapKind::CbvSrvUav))
        .collect();

    for frame_number in 0..FRAMES {
        if frame_number == FRAMES / 2 {
            if let Err(error) = device.resize_backbuffer(1920, 1080) {
                log::error!("resize failed: {error}");
            }
        }

        let frame = device.begin_frame();
        device.clear_backbuffer(&frame, Color::BLACK);

        std::thread::scope(|scope| {
            for (pass, texture) in textures.iter().enumerate() {
                let device = &device;
                let frame = &frame;

                scope.spawn(move || {
                    let _list = device.new_command_list(frame, QueueKind::Graphics);

                    let constants = PassConstants {
                        frame: frame_number,
                        pass: pass as u32,
                        tint: Color::BLUE.to_array(),
                    };
                    let allocation = device.upload_ring().upload(&[constants], 256);

                    let table = device.online_descriptor_allocator().allocate(1);
                    device.copy_descriptors(
                        1,
                        table.cpu,
                        texture.cpu,
                        DescriptorHeapKind::CbvSrvUav,
                    );

                    log::trace!(
                        "pass {pass} constants at {:#x}, descriptor table at {}",
                        allocation.gpu_address(),
                        table.index
                    );
                });
            }
        });

        device.end_frame(frame, true);

        // the emulated GPU only gets through part of the submitted work
        device.backend().advance(8);
    }

    log::info!(
        "{FRAMES} frames, {} presents, {} command lists executed",
        device.backend().presents(),
        device.backend().executed_command_lists()
    );

    for texture in textures {
        device.free_offline_descriptor(texture, DescriptorHeapKind::CbvSrvUav);
    }
}
