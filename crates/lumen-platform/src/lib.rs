// SPDX-License-Identifier: CEPL-1.0
//! Window-system glue: re-exports `winit` and condenses the window events the
//! renderer cares about into [`SurfaceSignal`]s.
pub use winit;

use winit::event::WindowEvent;

/// What a window event means for the presentation surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceSignal {
    /// Framebuffer size changed; a zero dimension means "minimized".
    Resized { width: u32, height: u32 },
    /// Visibility changed (occluded windows are paused, restored ones rebuilt).
    Occluded(bool),
    CloseRequested,
}

impl SurfaceSignal {
    pub fn from_window_event(event: &WindowEvent) -> Option<Self> {
        match event {
            WindowEvent::Resized(size) => Some(Self::Resized {
                width: size.width,
                height: size.height,
            }),
            WindowEvent::Occluded(occluded) => Some(Self::Occluded(*occluded)),
            WindowEvent::CloseRequested => Some(Self::CloseRequested),
            _ => None,
        }
    }

    /// True when the surface has no drawable area.
    pub fn is_zero_area(&self) -> bool {
        matches!(self, Self::Resized { width, height } if *width == 0 || *height == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::PhysicalSize;

    #[test]
    fn resize_maps_to_signal() {
        let ev = WindowEvent::Resized(PhysicalSize::new(1280, 720));
        assert_eq!(
            SurfaceSignal::from_window_event(&ev),
            Some(SurfaceSignal::Resized {
                width: 1280,
                height: 720
            })
        );
    }

    #[test]
    fn minimized_resize_is_zero_area() {
        let ev = WindowEvent::Resized(PhysicalSize::new(0, 720));
        let sig = SurfaceSignal::from_window_event(&ev).unwrap();
        assert!(sig.is_zero_area());
        assert!(!SurfaceSignal::Occluded(true).is_zero_area());
    }

    #[test]
    fn unrelated_events_are_ignored() {
        assert_eq!(
            SurfaceSignal::from_window_event(&WindowEvent::Focused(true)),
            None
        );
        assert_eq!(
            SurfaceSignal::from_window_event(&WindowEvent::CloseRequested),
            Some(SurfaceSignal::CloseRequested)
        );
    }
}
