//! Temporal accumulation and final composition.
//!
//! The accumulate pass reprojects last frame's history through the motion
//! vectors and blends the backend's output into the write half of the
//! history pair. Texels whose reprojected visibility id disagrees with the
//! current one drop their history instead of blending it. The result is
//! optionally handed to an external denoiser and finally composed into the
//! acquired surface image.

use crate::backend::{FrameContext, PassChain, PassDesc, ResourceContext, Source};
use crate::error::{ContractViolation, Result};
use crate::gpu::{Command, DeviceContext};
use crate::math::{write_floats, write_uints};
use crate::resource_state::{ResourceStateTracker, Usage};
use crate::surface::SurfaceResourceSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryState {
    /// Nothing accumulated yet; the next frame replaces history outright.
    Cold,
    Warm { accumulated: u32 },
}

impl HistoryState {
    /// Blend weight of the incoming frame.
    pub fn weight(self, temporal_frames: u32) -> f32 {
        match self {
            HistoryState::Cold => 1.0,
            HistoryState::Warm { accumulated } => {
                1.0 / (accumulated.saturating_add(1)).min(temporal_frames.max(1)) as f32
            }
        }
    }

    fn advance(self) -> Self {
        match self {
            HistoryState::Cold => HistoryState::Warm { accumulated: 1 },
            HistoryState::Warm { accumulated } => HistoryState::Warm {
                accumulated: accumulated.saturating_add(1),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenoiserRoute {
    /// Accumulated result goes through shared memory to an external filter.
    External,
    /// Compose straight from history, no denoising.
    Fallback,
}

const ACCUMULATE: usize = 0;
const COMPOSE: usize = 1;

/// Pipeline name of the accumulate pass.
pub const ACCUMULATE_PASS: &str = "accumulate";
pub const ACCUMULATE_INPUT_SLOT: u32 = 0;
pub const ACCUMULATE_MOTION_SLOT: u32 = 1;
pub const ACCUMULATE_PREVIOUS_IDS_SLOT: u32 = 2;
pub const ACCUMULATE_CURRENT_IDS_SLOT: u32 = 3;
pub const ACCUMULATE_HISTORY_SLOT: u32 = 4;
pub const ACCUMULATE_TARGET_SLOT: u32 = 5;
pub const ACCUMULATE_UNIFORM_SLOT: u32 = 6;

/// One texel of the accumulate pass: an exponential blend of the new sample
/// into reprojected history. History is dropped, not blended, when the
/// reprojected visibility id disagrees with the current one.
pub fn accumulate_texel(
    input: [f32; 4],
    history: [f32; 4],
    same_surface: bool,
    weight: f32,
) -> [f32; 4] {
    if !same_surface {
        return input;
    }
    std::array::from_fn(|channel| history[channel] + (input[channel] - history[channel]) * weight)
}

pub struct AccumulationCompositor {
    state: HistoryState,
    last_weight: Option<f32>,
    denoiser_requested: bool,
    route: DenoiserRoute,
    fallback_reported: bool,
    chain: PassChain,
}

impl AccumulationCompositor {
    pub fn new(denoiser_requested: bool) -> Self {
        Self {
            state: HistoryState::Cold,
            last_weight: None,
            denoiser_requested,
            route: DenoiserRoute::Fallback,
            fallback_reported: false,
            chain: PassChain::default(),
        }
    }

    pub fn state(&self) -> HistoryState {
        self.state
    }

    /// Weight used by the most recently recorded accumulate pass.
    pub fn last_weight(&self) -> Option<f32> {
        self.last_weight
    }

    pub fn route(&self) -> DenoiserRoute {
        self.route
    }

    /// Forces history back to cold, e.g. after a resize, a scene reload or
    /// camera motion.
    pub fn reset(&mut self) {
        if self.state != HistoryState::Cold {
            log::debug!("History reset");
        }
        self.state = HistoryState::Cold;
    }

    pub fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()> {
        if self.chain.is_created() {
            return Err(ContractViolation::AlreadyInitialized("compositor").into());
        }
        let staging = context.shared.surface.denoiser_staging().is_some();
        self.route = if self.denoiser_requested && staging {
            DenoiserRoute::External
        } else {
            if self.denoiser_requested && !self.fallback_reported {
                log::warn!(
                    "Device cannot share memory with the denoiser; composing without denoising"
                );
                self.fallback_reported = true;
            }
            DenoiserRoute::Fallback
        };

        self.chain.add(
            PassDesc::compute(ACCUMULATE_PASS, "accumulate.comp")
                .read(ACCUMULATE_INPUT_SLOT, Source::AccumulationInput)
                .read(ACCUMULATE_MOTION_SLOT, Source::MotionVectors)
                .read(ACCUMULATE_PREVIOUS_IDS_SLOT, Source::VisibilityRead)
                .read(ACCUMULATE_CURRENT_IDS_SLOT, Source::VisibilityWrite)
                .read(ACCUMULATE_HISTORY_SLOT, Source::HistoryRead)
                .write(ACCUMULATE_TARGET_SLOT, Source::HistoryWrite)
                .read(ACCUMULATE_UNIFORM_SLOT, Source::Uniforms),
            context,
        )?;
        let compose = match self.route {
            DenoiserRoute::External => {
                PassDesc::compute("compose denoised", "compose_denoised.comp")
                    .read(0, Source::DenoiserOutput)
            }
            DenoiserRoute::Fallback => {
                PassDesc::compute("compose", "compose.comp").read(0, Source::HistoryWrite)
            }
        };
        self.chain
            .add(compose.write(1, Source::Output).read(2, Source::Uniforms), context)
    }

    pub fn destroy_resources(
        &mut self,
        device: &dyn DeviceContext,
        tracker: &mut ResourceStateTracker,
    ) {
        self.chain.destroy(device, tracker);
    }

    /// The backend must have left the accumulation input storage-write visible.
    pub fn check_input(
        tracker: &ResourceStateTracker,
        surface: &SurfaceResourceSet,
        backend: &'static str,
    ) -> Result<(), ContractViolation> {
        let expected = Usage::StorageWrite.state();
        match tracker.state(surface.accumulation_input()) {
            Some(state) if state == expected => Ok(()),
            _ => Err(ContractViolation::AccumulationInputState { backend }),
        }
    }

    /// Records the accumulate pass and returns the blend weight it used.
    pub fn accumulate(&mut self, frame: &mut FrameContext) -> Result<f32> {
        let history = frame.shared.surface.history();
        if history.read(frame.frame) == history.write(frame.frame) {
            return Err(ContractViolation::PingPongAliased { frame: frame.frame }.into());
        }

        let weight = self.state.weight(frame.settings.temporal_frames);
        let mut constants = Vec::with_capacity(8);
        write_floats(&mut constants, &[weight]);
        write_uints(&mut constants, &[u32::from(self.state == HistoryState::Cold)]);

        frame.command_buffer.begin_label(ACCUMULATE_PASS);
        self.chain.record(ACCUMULATE, frame, constants)?;
        frame.command_buffer.end_label();

        self.state = self.state.advance();
        self.last_weight = Some(weight);
        Ok(weight)
    }

    /// Denoises when possible and writes the final image into the acquired
    /// surface image, leaving it ready to present.
    pub fn compose(&mut self, frame: &mut FrameContext) -> Result<()> {
        let surface = frame.shared.surface;
        frame.command_buffer.begin_label("compose");

        if self.route == DenoiserRoute::External {
            if let Some(staging) = surface.denoiser_staging() {
                let [input, output] = staging.images();
                let accumulated = surface.history().write(frame.frame);
                frame.tracker.transition(frame.command_buffer, accumulated, Usage::TransferSrc)?;
                frame.tracker.transition(frame.command_buffer, input, Usage::TransferDst)?;
                frame.command_buffer.push(Command::CopyImage {
                    src: accumulated,
                    dst: input,
                });
                frame.tracker.transition(frame.command_buffer, input, Usage::ExternalShared)?;
                frame.tracker.transition(frame.command_buffer, output, Usage::ExternalShared)?;
                frame.command_buffer.push(Command::ExternalHandoff { input, output });
            }
        }
        self.chain.record(COMPOSE, frame, Vec::new())?;

        let target = surface.surface_image(frame.image_index);
        frame.tracker.transition(frame.command_buffer, surface.output(), Usage::TransferSrc)?;
        frame.tracker.transition(frame.command_buffer, target, Usage::TransferDst)?;
        frame.command_buffer.push(Command::CopyImage {
            src: surface.output(),
            dst: target,
        });
        frame.tracker.transition(frame.command_buffer, target, Usage::Present)?;
        frame.command_buffer.end_label();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::Harness;
    use crate::backend::{create_backend, BackendKind, SharedResources};
    use crate::gpu::headless::{DeviceEvent, HeadlessConfig};
    use crate::gpu::{CommandBuffer, DeviceCapabilities};
    use crate::resource_state::validate_barriers;
    use crate::surface::SurfaceConfig;
    use ash::vk;

    #[test]
    fn cold_frame_replaces_history() {
        assert_eq!(HistoryState::Cold.weight(64), 1.0);
        assert_eq!(HistoryState::Warm { accumulated: 1 }.weight(64), 0.5);
        assert_eq!(HistoryState::Warm { accumulated: 3 }.weight(64), 0.25);
    }

    #[test]
    fn weight_settles_at_temporal_window() {
        assert_eq!(HistoryState::Warm { accumulated: 500 }.weight(64), 1.0 / 64.0);
        assert_eq!(HistoryState::Warm { accumulated: 500 }.weight(0), 1.0);
    }

    fn create(harness: &mut Harness, compositor: &mut AccumulationCompositor) -> Result<()> {
        let uniform_buffers = harness.frames.uniform_buffers();
        let mut context = ResourceContext {
            device: &harness.dyn_device,
            tracker: &mut harness.tracker,
            shaders: &mut harness.shaders,
            shared: SharedResources {
                surface: &harness.surface,
                scene: &harness.scene,
                accel: &harness.accel,
                textures: &harness.textures,
            },
            uniform_buffers: &uniform_buffers,
            settings: &harness.settings,
        };
        compositor.create_resources(&mut context)
    }

    fn record_frame(
        harness: &mut Harness,
        backend: &mut dyn crate::backend::RenderBackend,
        compositor: &mut AccumulationCompositor,
        frame: u64,
    ) -> (CommandBuffer, f32) {
        let slot = (frame % 2) as usize;
        let uniform_buffer = harness.frames.slot(slot).uniform_buffer();
        let mut command_buffer = CommandBuffer::new("compositor test");
        harness.tracker.begin_recording(&mut command_buffer);
        let mut context = FrameContext {
            command_buffer: &mut command_buffer,
            tracker: &mut harness.tracker,
            shared: SharedResources {
                surface: &harness.surface,
                scene: &harness.scene,
                accel: &harness.accel,
                textures: &harness.textures,
            },
            slot,
            frame,
            image_index: 0,
            uniform_buffer,
            settings: &harness.settings,
        };
        backend.render(&mut context).unwrap();
        AccumulationCompositor::check_input(context.tracker, context.shared.surface, "test")
            .unwrap();
        let weight = compositor.accumulate(&mut context).unwrap();
        compositor.compose(&mut context).unwrap();
        (command_buffer, weight)
    }

    /// Records only the accumulate pass over whatever the input holds.
    fn accumulate_only(harness: &mut Harness, compositor: &mut AccumulationCompositor, frame: u64) {
        let slot = (frame % 2) as usize;
        let uniform_buffer = harness.frames.slot(slot).uniform_buffer();
        let mut command_buffer = CommandBuffer::new("accumulate test");
        harness.tracker.begin_recording(&mut command_buffer);
        let input = harness.surface.accumulation_input();
        harness
            .tracker
            .transition(&mut command_buffer, input, Usage::StorageWrite)
            .unwrap();
        let mut context = FrameContext {
            command_buffer: &mut command_buffer,
            tracker: &mut harness.tracker,
            shared: SharedResources {
                surface: &harness.surface,
                scene: &harness.scene,
                accel: &harness.accel,
                textures: &harness.textures,
            },
            slot,
            frame,
            image_index: 0,
            uniform_buffer,
            settings: &harness.settings,
        };
        compositor.accumulate(&mut context).unwrap();
        harness.dyn_device.submit_and_wait(&command_buffer).unwrap();
    }

    const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
    const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

    #[test]
    fn texel_blends_or_drops_history() {
        assert_eq!(accumulate_texel(BLUE, RED, true, 0.25), [0.75, 0.0, 0.25, 1.0]);
        assert_eq!(accumulate_texel(BLUE, RED, false, 0.25), BLUE);
        assert_eq!(accumulate_texel(BLUE, RED, true, 1.0), BLUE);
    }

    #[test]
    fn warm_frame_blends_with_history() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let mut compositor = AccumulationCompositor::new(false);
        create(&mut harness, &mut compositor).unwrap();
        let input = harness.surface.accumulation_input();
        let history = *harness.surface.history();

        harness.device.set_image_color(input, RED);
        accumulate_only(&mut harness, &mut compositor, 0);
        assert_eq!(harness.device.image_color(history.write(0)), Some(RED));

        harness.device.set_image_color(input, BLUE);
        accumulate_only(&mut harness, &mut compositor, 1);
        assert_eq!(
            harness.device.image_color(history.write(1)),
            Some([0.5, 0.0, 0.5, 1.0])
        );
        assert_eq!(harness.device.hazard_count(), 0);
    }

    #[test]
    fn mismatched_visibility_drops_history() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let mut compositor = AccumulationCompositor::new(false);
        create(&mut harness, &mut compositor).unwrap();
        let input = harness.surface.accumulation_input();
        let history = *harness.surface.history();
        let visibility = *harness.surface.visibility();

        harness.device.set_image_color(input, RED);
        accumulate_only(&mut harness, &mut compositor, 0);

        // Last frame saw a different surface under this texel.
        harness.device.set_image_color(visibility.read(1), [7.0, 0.0, 0.0, 0.0]);
        harness.device.set_image_color(visibility.write(1), [3.0, 0.0, 0.0, 0.0]);
        harness.device.set_image_color(input, BLUE);
        accumulate_only(&mut harness, &mut compositor, 1);

        assert_eq!(compositor.last_weight(), Some(0.5));
        assert_eq!(harness.device.image_color(history.write(1)), Some(BLUE));
    }

    #[test]
    fn first_frame_is_cold_then_warms_up() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let mut backend = create_backend(BackendKind::SoftwareTracing);
        harness.create(backend.as_mut()).unwrap();
        let mut compositor = AccumulationCompositor::new(false);
        create(&mut harness, &mut compositor).unwrap();

        let (first, weight) = record_frame(&mut harness, backend.as_mut(), &mut compositor, 0);
        assert_eq!(weight, 1.0);
        assert!(validate_barriers(&first).is_empty());
        assert_eq!(compositor.state(), HistoryState::Warm { accumulated: 1 });

        let (_, weight) = record_frame(&mut harness, backend.as_mut(), &mut compositor, 1);
        assert_eq!(weight, 0.5);

        compositor.reset();
        let (_, weight) = record_frame(&mut harness, backend.as_mut(), &mut compositor, 2);
        assert_eq!(weight, 1.0);
        assert_eq!(compositor.last_weight(), Some(1.0));
    }

    #[test]
    fn accumulate_writes_the_other_history_half_each_frame() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let mut backend = create_backend(BackendKind::SoftwareTracing);
        harness.create(backend.as_mut()).unwrap();
        let mut compositor = AccumulationCompositor::new(false);
        create(&mut harness, &mut compositor).unwrap();

        let history = *harness.surface.history();
        let mut previous_write = None;
        for frame in 0..4 {
            let (cmd, _) = record_frame(&mut harness, backend.as_mut(), &mut compositor, frame);
            let pass = cmd.passes().find(|pass| pass.label == "accumulate").unwrap();
            let written: Vec<_> = pass
                .accesses
                .iter()
                .filter(|(_, usage)| usage.is_write())
                .map(|(resource, _)| *resource)
                .collect();
            assert_eq!(written, vec![history.write(frame).into()]);
            if let Some(previous) = previous_write {
                assert_eq!(history.read(frame), previous);
            }
            previous_write = Some(history.write(frame));
        }
    }

    #[test]
    fn surface_image_ends_ready_to_present() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let mut backend = create_backend(BackendKind::LegacyDeferred);
        harness.create(backend.as_mut()).unwrap();
        let mut compositor = AccumulationCompositor::new(false);
        create(&mut harness, &mut compositor).unwrap();

        record_frame(&mut harness, backend.as_mut(), &mut compositor, 0);
        let target = harness.surface.surface_image(0);
        assert_eq!(harness.tracker.state(target), Some(Usage::Present.state()));
    }

    #[test]
    fn falls_back_without_external_memory() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let mut compositor = AccumulationCompositor::new(true);
        create(&mut harness, &mut compositor).unwrap();
        assert_eq!(compositor.route(), DenoiserRoute::Fallback);
    }

    #[test]
    fn hands_off_to_external_denoiser_when_shared_memory_exists() {
        let mut harness = Harness::new(HeadlessConfig {
            capabilities: DeviceCapabilities {
                external_memory: true,
                ..DeviceCapabilities::default()
            },
            ..HeadlessConfig::default()
        });
        // Rebuild the surface with staging images.
        harness.dyn_device.wait_idle().unwrap();
        let old = std::mem::replace(
            &mut harness.surface,
            SurfaceResourceSet::new(
                harness.dyn_device.clone(),
                &mut harness.tracker,
                SurfaceConfig {
                    extent: vk::Extent2D {
                        width: 64,
                        height: 64,
                    },
                    image_count: 2,
                    present_mode: vk::PresentModeKHR::FIFO,
                    denoiser_staging: true,
                },
            )
            .unwrap(),
        );
        old.destroy(&mut harness.tracker);

        let mut backend = create_backend(BackendKind::PathTracing);
        harness.create(backend.as_mut()).unwrap();
        let mut compositor = AccumulationCompositor::new(true);
        create(&mut harness, &mut compositor).unwrap();
        assert_eq!(compositor.route(), DenoiserRoute::External);

        let (cmd, _) = record_frame(&mut harness, backend.as_mut(), &mut compositor, 0);
        assert!(validate_barriers(&cmd).is_empty());
        assert!(cmd
            .commands()
            .iter()
            .any(|command| matches!(command, Command::ExternalHandoff { .. })));

        harness.dyn_device.submit_and_wait(&cmd).unwrap();
        assert!(harness.device.events().contains(&DeviceEvent::ExternalHandoff));
    }

    #[test]
    fn misbehaving_backend_is_caught() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let input = harness.surface.accumulation_input();
        let mut cmd = CommandBuffer::new("bad backend");
        harness.tracker.begin_recording(&mut cmd);
        harness.tracker.transition(&mut cmd, input, Usage::Sampled).unwrap();
        assert_eq!(
            AccumulationCompositor::check_input(&harness.tracker, &harness.surface, "bad"),
            Err(ContractViolation::AccumulationInputState { backend: "bad" })
        );
    }

    #[test]
    fn creating_twice_is_a_contract_violation() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let mut compositor = AccumulationCompositor::new(false);
        create(&mut harness, &mut compositor).unwrap();
        assert!(matches!(
            create(&mut harness, &mut compositor),
            Err(crate::error::RenderError::Contract(
                ContractViolation::AlreadyInitialized("compositor")
            ))
        ));

        compositor.destroy_resources(harness.dyn_device.as_ref(), &mut harness.tracker);
        create(&mut harness, &mut compositor).unwrap();
    }
}
