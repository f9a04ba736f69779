use std::rc::Rc;

use ash::vk;

use crate::error::Result;
use crate::gpu::{
    DeviceContext, ImageDesc, ImageHandle, Swapchain, SwapchainDesc,
};
use crate::resource_state::ResourceStateTracker;

pub const SURFACE_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
pub const ACCUMULATION_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
pub const MOTION_FORMAT: vk::Format = vk::Format::R16G16_SFLOAT;
pub const VISIBILITY_FORMAT: vk::Format = vk::Format::R32G32_UINT;
pub const AUXILIARY_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceConfig {
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    /// Allocate images shareable with an external denoiser.
    pub denoiser_staging: bool,
}

/// Two images whose read and write roles swap every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingPong {
    images: [ImageHandle; 2],
}

impl PingPong {
    pub fn new(images: [ImageHandle; 2]) -> Self {
        Self { images }
    }

    /// `(read, write)` indices for frame `frame`.
    pub fn roles(frame: u64) -> (usize, usize) {
        ((frame % 2) as usize, ((frame + 1) % 2) as usize)
    }

    pub fn read(&self, frame: u64) -> ImageHandle {
        self.images[Self::roles(frame).0]
    }

    pub fn write(&self, frame: u64) -> ImageHandle {
        self.images[Self::roles(frame).1]
    }

    pub fn by_parity(&self, parity: usize) -> (ImageHandle, ImageHandle) {
        let (read, write) = Self::roles(parity as u64);
        (self.images[read], self.images[write])
    }

    pub fn images(&self) -> [ImageHandle; 2] {
        self.images
    }
}

/// The presentation surface plus every resolution dependent target. Built
/// and torn down as a unit.
pub struct SurfaceResourceSet {
    device: Rc<dyn DeviceContext>,
    config: SurfaceConfig,
    swapchain: Swapchain,
    // Creation order; torn down in reverse.
    owned: Vec<(ImageHandle, ImageDesc)>,
    depth: ImageHandle,
    accumulation_input: ImageHandle,
    motion_vectors: ImageHandle,
    visibility: PingPong,
    history: PingPong,
    albedo: ImageHandle,
    normal: ImageHandle,
    denoiser_staging: Option<PingPong>,
    output: ImageHandle,
}

impl SurfaceResourceSet {
    pub fn new(
        device: Rc<dyn DeviceContext>,
        tracker: &mut ResourceStateTracker,
        config: SurfaceConfig,
    ) -> Result<Self> {
        let swapchain = device.create_swapchain(&SwapchainDesc {
            extent: config.extent,
            format: SURFACE_FORMAT,
            image_count: config.image_count,
            present_mode: config.present_mode,
        })?;
        for image in &swapchain.images {
            tracker.register(*image, "surface image");
        }

        // The platform decides the final size.
        let extent = swapchain.extent;
        let mut owned = Vec::new();
        let mut create = |desc: ImageDesc| -> Result<ImageHandle> {
            let image = device.create_image(&desc)?;
            tracker.register(image, &desc.label);
            owned.push((image, desc));
            Ok(image)
        };

        use vk::ImageUsageFlags as U;
        let depth = create(ImageDesc::new(
            "depth",
            extent,
            DEPTH_FORMAT,
            U::DEPTH_STENCIL_ATTACHMENT | U::SAMPLED,
        ))?;
        let accumulation_input = create(ImageDesc::new(
            "accumulation input",
            extent,
            ACCUMULATION_FORMAT,
            U::STORAGE | U::SAMPLED | U::TRANSFER_DST,
        ))?;
        let motion_vectors = create(ImageDesc::new(
            "motion vectors",
            extent,
            MOTION_FORMAT,
            U::STORAGE | U::COLOR_ATTACHMENT | U::TRANSFER_DST,
        ))?;
        let visibility = PingPong::new([
            create(ImageDesc::new(
                "visibility 0",
                extent,
                VISIBILITY_FORMAT,
                U::STORAGE | U::COLOR_ATTACHMENT | U::TRANSFER_DST,
            ))?,
            create(ImageDesc::new(
                "visibility 1",
                extent,
                VISIBILITY_FORMAT,
                U::STORAGE | U::COLOR_ATTACHMENT | U::TRANSFER_DST,
            ))?,
        ]);
        let history = PingPong::new([
            create(ImageDesc::new(
                "history 0",
                extent,
                ACCUMULATION_FORMAT,
                U::STORAGE | U::SAMPLED | U::TRANSFER_SRC,
            ))?,
            create(ImageDesc::new(
                "history 1",
                extent,
                ACCUMULATION_FORMAT,
                U::STORAGE | U::SAMPLED | U::TRANSFER_SRC,
            ))?,
        ]);
        let albedo = create(ImageDesc::new(
            "albedo",
            extent,
            AUXILIARY_FORMAT,
            U::STORAGE | U::COLOR_ATTACHMENT,
        ))?;
        let normal = create(ImageDesc::new(
            "normal",
            extent,
            AUXILIARY_FORMAT,
            U::STORAGE | U::COLOR_ATTACHMENT,
        ))?;
        let denoiser_staging = if config.denoiser_staging {
            Some(PingPong::new([
                create(
                    ImageDesc::new(
                        "denoiser input",
                        extent,
                        ACCUMULATION_FORMAT,
                        U::STORAGE | U::TRANSFER_DST,
                    )
                    .exported(),
                )?,
                create(
                    ImageDesc::new(
                        "denoiser output",
                        extent,
                        ACCUMULATION_FORMAT,
                        U::STORAGE | U::TRANSFER_SRC,
                    )
                    .exported(),
                )?,
            ]))
        } else {
            None
        };
        let output = create(ImageDesc::new(
            "output",
            extent,
            OUTPUT_FORMAT,
            U::STORAGE | U::TRANSFER_SRC,
        ))?;

        log::info!(
            "Surface {}x{} with {} images, {} targets",
            extent.width,
            extent.height,
            swapchain.images.len(),
            owned.len()
        );

        Ok(Self {
            device,
            config,
            swapchain,
            owned,
            depth,
            accumulation_input,
            motion_vectors,
            visibility,
            history,
            albedo,
            normal,
            denoiser_staging,
            output,
        })
    }

    pub fn config(&self) -> SurfaceConfig {
        self.config
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.images.len()
    }

    pub fn surface_image(&self, index: u32) -> ImageHandle {
        self.swapchain.images[index as usize % self.swapchain.images.len()]
    }

    pub fn depth(&self) -> ImageHandle {
        self.depth
    }

    pub fn accumulation_input(&self) -> ImageHandle {
        self.accumulation_input
    }

    pub fn motion_vectors(&self) -> ImageHandle {
        self.motion_vectors
    }

    pub fn visibility(&self) -> &PingPong {
        &self.visibility
    }

    pub fn history(&self) -> &PingPong {
        &self.history
    }

    pub fn albedo(&self) -> ImageHandle {
        self.albedo
    }

    pub fn normal(&self) -> ImageHandle {
        self.normal
    }

    pub fn denoiser_staging(&self) -> Option<&PingPong> {
        self.denoiser_staging.as_ref()
    }

    pub fn output(&self) -> ImageHandle {
        self.output
    }

    /// Formats, usages and sizes of every owned target in creation order.
    pub fn descriptor(&self) -> Vec<ImageDesc> {
        self.owned.iter().map(|(_, desc)| desc.clone()).collect()
    }

    pub fn owned_images(&self) -> Vec<ImageHandle> {
        self.owned.iter().map(|(image, _)| *image).collect()
    }

    /// The device must be idle.
    pub fn destroy(self, tracker: &mut ResourceStateTracker) {
        for (image, _) in self.owned.iter().rev() {
            tracker.forget(*image);
            self.device.destroy_image(*image);
        }
        for image in &self.swapchain.images {
            tracker.forget(*image);
        }
        self.device.destroy_swapchain(self.swapchain.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessConfig, HeadlessDevice};
    use crate::gpu::DeviceCapabilities;

    fn config(external: bool) -> SurfaceConfig {
        SurfaceConfig {
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            image_count: 3,
            present_mode: vk::PresentModeKHR::FIFO,
            denoiser_staging: external,
        }
    }

    #[test]
    fn ping_pong_roles_alternate() {
        for frame in 1..64u64 {
            let (read, write) = PingPong::roles(frame);
            let (_, previous_write) = PingPong::roles(frame - 1);
            assert_ne!(read, write);
            assert_eq!(previous_write, read);
        }
    }

    #[test]
    fn recreate_with_same_extent_matches() {
        let device = Rc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let mut tracker = ResourceStateTracker::new();

        let first = SurfaceResourceSet::new(device.clone(), &mut tracker, config(false)).unwrap();
        let before = first.descriptor();
        let old_images = first.owned_images();
        first.destroy(&mut tracker);
        assert_eq!(tracker.tracked_count(), 0);

        let second = SurfaceResourceSet::new(device.clone(), &mut tracker, config(false)).unwrap();
        assert_eq!(second.descriptor(), before);
        let live = device.live_images();
        assert!(old_images.iter().all(|image| !live.contains(image)));
    }

    #[test]
    fn staging_images_need_external_memory() {
        let device = Rc::new(HeadlessDevice::new(HeadlessConfig {
            capabilities: DeviceCapabilities {
                external_memory: true,
                ..Default::default()
            },
            ..Default::default()
        }));
        let mut tracker = ResourceStateTracker::new();
        let surface = SurfaceResourceSet::new(device, &mut tracker, config(true)).unwrap();
        assert!(surface.denoiser_staging().is_some());
        assert_eq!(surface.descriptor().len(), 12);
    }
}
