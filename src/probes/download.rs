use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::backend::{GpuDevice, GpuTexture};
use crate::resources::TextureData;

/// Result of a GPU readback finished on a worker thread.
///
/// Poll it from the main thread with [`try_take`](Self::try_take) once per
/// frame, or await it. The waker registered by the last poll is woken when
/// the worker sends, so blocking executors make progress.
pub struct DownloadHandle<T> {
    receiver: mpsc::Receiver<T>,
    waker: Arc<Mutex<Option<Waker>>>,
}

/// Completion side of a [`DownloadHandle`]
pub struct DownloadSender<T> {
    sender: mpsc::Sender<T>,
    waker: Arc<Mutex<Option<Waker>>>,
}

/// Connected sender and handle
pub fn download_channel<T>() -> (DownloadSender<T>, DownloadHandle<T>) {
    let (sender, receiver) = mpsc::channel();
    let waker = Arc::new(Mutex::new(None));
    (
        DownloadSender {
            sender,
            waker: waker.clone(),
        },
        DownloadHandle { receiver, waker },
    )
}

impl<T> DownloadSender<T> {
    pub fn send(self, value: T) {
        // The handle may be gone already
        let _ = self.sender.send(value);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

impl<T> Drop for DownloadSender<T> {
    fn drop(&mut self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

impl<T> DownloadHandle<T> {
    /// The value if the download finished. Consumes it.
    pub fn try_take(&self) -> Option<T> {
        self.try_finish().flatten()
    }

    /// `Some` once the download finished or failed. Consumes the value.
    pub fn try_finish(&self) -> Option<Option<T>> {
        match self.receiver.try_recv() {
            Ok(value) => Some(Some(value)),
            Err(mpsc::TryRecvError::Disconnected) => Some(None),
            Err(mpsc::TryRecvError::Empty) => None,
        }
    }
}

impl<T> Future for DownloadHandle<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self.receiver.try_recv() {
            Ok(value) => return Poll::Ready(Some(value)),
            Err(mpsc::TryRecvError::Disconnected) => return Poll::Ready(None),
            Err(mpsc::TryRecvError::Empty) => {}
        }
        *self.waker.lock() = Some(cx.waker().clone());
        // A send may have landed before the waker was stored
        match self.receiver.try_recv() {
            Ok(value) => Poll::Ready(Some(value)),
            Err(mpsc::TryRecvError::Disconnected) => Poll::Ready(None),
            Err(mpsc::TryRecvError::Empty) => Poll::Pending,
        }
    }
}

/// Read a texture back and finish the asset on a worker thread
pub fn download_texture(device: &mut dyn GpuDevice, texture: &GpuTexture) -> DownloadHandle<Arc<TextureData>> {
    let (sender, handle) = download_channel();
    match device.download_texture(texture) {
        Ok(data) => {
            std::thread::spawn(move || {
                log::trace!(
                    "Probe download '{}' finished ({} bytes)",
                    data.name,
                    data.data.len()
                );
                sender.send(Arc::new(data));
            });
        }
        Err(err) => {
            log::warn!("Probe download failed: {err}");
            drop(sender);
        }
    }
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::*;

    #[test]
    fn test_try_take_before_and_after_send() {
        let (sender, handle) = download_channel::<u32>();
        assert_eq!(handle.try_take(), None);
        sender.send(7);
        assert_eq!(handle.try_take(), Some(7));
    }

    #[test]
    fn test_dropped_sender_resolves_to_none() {
        let (sender, handle) = download_channel::<u32>();
        drop(sender);
        assert_eq!(handle.try_finish(), Some(None));
        assert_eq!(pollster::block_on(handle), None);
    }

    #[test]
    fn test_worker_thread_wakes_blocking_poll() {
        let (sender, handle) = download_channel::<u32>();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            sender.send(42);
        });
        assert_eq!(pollster::block_on(handle), Some(42));
        worker.join().unwrap();
    }

    #[test]
    fn test_download_texture() {
        let mut device = RecordingDevice::new();
        let desc = TextureDescriptor::new_cube(8, TextureFormat::Rgba16Float, TextureFlags::SHADER_RESOURCE, 4);
        let cube = device.create_texture("Probe", &desc).unwrap();

        let data = pollster::block_on(download_texture(&mut device, &cube)).unwrap();
        assert_eq!(data.array_size, 6);
        assert_eq!(data.mip_levels, 4);
        assert_eq!(data.name, "Probe");

        device.destroy_texture(cube);
        assert_eq!(pollster::block_on(download_texture(&mut device, &cube)), None);
    }
}
