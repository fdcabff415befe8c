//! Applying rebindings to every image the OS loader has mapped or will map.

use crate::{
    RebindRegistry, Rebinding, Result, os::ProtFlags, patcher::patch_image,
};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

/// A loaded image as reported by the OS loader: its header address and the
/// load bias (slide) applied to every address recorded in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    header: NonNull<u8>,
    slide: isize,
}

unsafe impl Send for LoadedImage {}
unsafe impl Sync for LoadedImage {}

impl LoadedImage {
    #[inline]
    pub const fn new(header: NonNull<u8>, slide: isize) -> Self {
        Self { header, slide }
    }

    #[inline]
    pub fn header(&self) -> NonNull<u8> {
        self.header
    }

    #[inline]
    pub fn slide(&self) -> isize {
        self.slide
    }
}

/// Receiver of image-load events.
pub trait AddImageHook: Sync {
    /// Called once for each image, on whatever thread the loader reports it from.
    fn image_added(&self, image: LoadedImage);
}

/// The OS loader's image registry, as far as rebinding needs it.
///
/// On Apple targets [`Dyld`](crate::Dyld) implements this on top of dyld. Other
/// implementations exist mainly to drive the rebinding machinery over images
/// that were mapped by other means.
pub trait ImageLoader: Sync {
    /// Number of images mapped right now.
    fn image_count(&self) -> u32;

    /// The image at `index`, or `None` if it went away or the index is stale.
    fn image(&self, index: u32) -> Option<LoadedImage>;

    /// Address-to-image reverse lookup: whether `addr` lies inside a mapped image.
    fn contains(&self, addr: *const u8) -> bool;

    /// Registers `hook` for image-load events.
    ///
    /// The hook must be called synchronously, before this returns, for every
    /// image already mapped, and afterwards once for every image mapped later.
    /// A registration is permanent.
    fn on_image_added(&self, hook: &'static dyn AddImageHook) -> Result<()>;

    /// Changes the protection of the pages covering `[addr, addr + len)`.
    ///
    /// # Safety
    /// See [`os::mprotect`](crate::os::mprotect).
    unsafe fn mprotect(&self, addr: usize, len: usize, prot: ProtFlags) -> Result<()>;

    /// Iterates over the images mapped right now.
    fn images(&self) -> impl Iterator<Item = LoadedImage> + '_
    where
        Self: Sized,
    {
        (0..self.image_count()).filter_map(move |index| self.image(index))
    }
}

/// Drives a registry over every image of an [`ImageLoader`].
///
/// The first successful call installs a load hook with the loader; the hook
/// always patches against the registry's current contents, so images mapped
/// later see every batch submitted up to that point. Later calls re-scan the
/// images that are already mapped.
///
/// # Examples
/// ```no_run
/// # #[cfg(target_vendor = "apple")]
/// # {
/// use macho_rebind::{Dyld, ImageEnumerator, RebindRegistry, Rebinding};
///
/// static REGISTRY: RebindRegistry = RebindRegistry::new();
/// static ENUMERATOR: ImageEnumerator<Dyld> = ImageEnumerator::new(&REGISTRY, &Dyld);
///
/// extern "C" fn fake_getpid() -> i32 { 42 }
///
/// unsafe { ENUMERATOR.apply_globally(&[Rebinding::new("getpid", fake_getpid as *const ())]) }
///     .unwrap();
/// # }
/// ```
pub struct ImageEnumerator<L: ImageLoader + 'static> {
    registry: &'static RebindRegistry,
    loader: &'static L,
    /// Set once `loader` accepted the load hook.
    installed: AtomicBool,
}

impl<L: ImageLoader + 'static> ImageEnumerator<L> {
    pub const fn new(registry: &'static RebindRegistry, loader: &'static L) -> Self {
        Self {
            registry,
            loader,
            installed: AtomicBool::new(false),
        }
    }

    /// Whether the load hook is in place, so images mapped from now on get patched.
    #[inline]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn registry(&self) -> &'static RebindRegistry {
        self.registry
    }

    #[inline]
    pub fn loader(&self) -> &'static L {
        self.loader
    }

    /// Records `rebindings` for the lifetime of the process and applies them to
    /// every image, mapped now or later.
    ///
    /// Symbols that no image imports are ignored. The only error is an
    /// allocation failure. If it happens while recording the batch, nothing was
    /// patched and the batch is not part of the registry. If the loader could
    /// not take the load hook, the batch is recorded but only reaches images
    /// once a later call gets the hook installed.
    ///
    /// # Safety
    /// Each replacement must be a valid stand-in for the symbol it replaces, and
    /// no other thread may call through, or otherwise read, the affected pointer
    /// slots while they are being rewritten. Calls that change the registry must
    /// not race with each other.
    pub unsafe fn apply_globally(&'static self, rebindings: &[Rebinding]) -> Result<()> {
        self.registry.submit(rebindings)?;
        if self.is_installed() {
            unsafe { self.rescan() };
            return Ok(());
        }
        #[cfg(feature = "log")]
        log::debug!("[Enumerator] installing image load hook");
        // The loader replays the mapped images to the hook, which covers every
        // batch recorded while earlier installs were failing.
        self.loader.on_image_added(self)?;
        self.installed.store(true, Ordering::Release);
        Ok(())
    }

    /// Applies the current registry to every image mapped right now.
    ///
    /// # Safety
    /// Same contract as [`apply_globally`](Self::apply_globally).
    pub unsafe fn rescan(&self) -> usize {
        let patched: usize = self
            .loader
            .images()
            .map(|image| unsafe { patch_image(self.registry, self.loader, image) })
            .sum();
        #[cfg(feature = "log")]
        log::debug!("[Enumerator] rescan rewrote {} slots", patched);
        patched
    }

    /// Applies `rebindings` to `image` only, without recording them.
    ///
    /// # Safety
    /// Same contract as [`apply_globally`](Self::apply_globally).
    pub unsafe fn apply_to_one_image(
        &self,
        image: LoadedImage,
        rebindings: &[Rebinding],
    ) -> Result<()> {
        unsafe { apply_to_one_image(self.loader, image, rebindings) }
    }
}

impl<L: ImageLoader + 'static> AddImageHook for ImageEnumerator<L> {
    fn image_added(&self, image: LoadedImage) {
        // The caller of `apply_globally` accepted the rewrite contract for every
        // image, including those mapped later.
        let _patched = unsafe { patch_image(self.registry, self.loader, image) };
        #[cfg(feature = "log")]
        log::trace!(
            "image [0x{:x}] added, rewrote {} slots",
            image.header().as_ptr() as usize,
            _patched
        );
    }
}

/// Applies a standalone batch to one image through `loader`.
///
/// # Safety
/// Same contract as [`ImageEnumerator::apply_globally`].
pub unsafe fn apply_to_one_image<L: ImageLoader + ?Sized>(
    loader: &L,
    image: LoadedImage,
    rebindings: &[Rebinding],
) -> Result<()> {
    let batch = RebindRegistry::new();
    batch.submit(rebindings)?;
    unsafe { patch_image(&batch, loader, image) };
    Ok(())
}
