// SPDX-License-Identifier: CEPL-1.0
//! Per-tick state machine: acquire, record, submit, present, and rebuild the
//! swapchain when it goes stale or the host flags a resize.
use bitflags::bitflags;
use lumen_render::FrameScene;
use tracing::{debug, info, trace};

use crate::error::VkError;
use crate::sync::SlotRing;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RecreateReason: u8 {
        const RESIZED = 1;
        const RESTORED = 1 << 1;
        const OUT_OF_DATE = 1 << 2;
        const SHADERS = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    AcquireImage,
    RecordCommands,
    SubmitGraphics,
    Present,
    RecreateSwapchain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Presented {
        image: u32,
        slot: usize,
        recreated: bool,
    },
    /// Acquire reported a stale surface; the swapchain was rebuilt instead.
    Skipped,
}

/// GPU side of one tick. The `ash` implementation lives in `backend`.
pub trait FrameBackend {
    fn flight_slot_count(&self) -> usize;
    /// Blocks until an image is available; stale surfaces yield `SurfaceStale`.
    fn acquire(&mut self, slot: usize) -> Result<u32, VkError>;
    /// Waits on the image's frame fence, then resets fence and command buffer.
    fn wait_frame(&mut self, image: u32) -> Result<(), VkError>;
    /// Writes the frame's uniforms, begins its command buffer and opens the pass.
    fn begin_pass(&mut self, image: u32, scene: &FrameScene) -> Result<(), VkError>;
    fn record_scene(&mut self, image: u32, scene: &FrameScene) -> Result<(), VkError>;
    /// Still inside the pass, after every scene draw. No-op without an overlay.
    fn record_overlay(&mut self, image: u32) -> Result<(), VkError>;
    /// Closes the pass and the command buffer.
    fn end_pass(&mut self, image: u32) -> Result<(), VkError>;
    fn submit(&mut self, image: u32, slot: usize) -> Result<(), VkError>;
    fn present(&mut self, image: u32, slot: usize) -> Result<(), VkError>;
    /// Tears down and rebuilds every swapchain-derived resource.
    fn recreate(&mut self, reason: RecreateReason) -> Result<(), VkError>;
    fn wait_idle(&mut self) -> Result<(), VkError>;
}

pub struct RenderLoop {
    ring: SlotRing,
    pending: RecreateReason,
    state: LoopState,
}

impl RenderLoop {
    pub fn new(flight_slots: usize) -> Self {
        Self {
            ring: SlotRing::new(flight_slots),
            pending: RecreateReason::empty(),
            state: LoopState::AcquireImage,
        }
    }

    pub fn request_recreate(&mut self, reason: RecreateReason) {
        self.pending |= reason;
    }

    pub fn pending(&self) -> RecreateReason {
        self.pending
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn current_slot(&self) -> usize {
        self.ring.current()
    }

    fn enter(&mut self, state: LoopState) {
        trace!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Anything other than a stale surface is returned as fatal.
    pub fn tick<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        scene: &FrameScene,
    ) -> Result<TickOutcome, VkError> {
        self.enter(LoopState::AcquireImage);
        let slot = self.ring.current();
        let image = match backend.acquire(slot) {
            Ok(i) => i,
            Err(e) if e.is_stale() => {
                debug!("acquire stale; rebuilding and skipping frame");
                self.recreate(backend, RecreateReason::OUT_OF_DATE)?;
                return Ok(TickOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        self.enter(LoopState::RecordCommands);
        backend.wait_frame(image)?;
        backend.begin_pass(image, scene)?;
        backend.record_scene(image, scene)?;
        backend.record_overlay(image)?;
        backend.end_pass(image)?;

        self.enter(LoopState::SubmitGraphics);
        backend.submit(image, slot)?;
        self.ring.advance();

        self.enter(LoopState::Present);
        match backend.present(image, slot) {
            Ok(()) => {}
            Err(e) if e.is_stale() => self.pending |= RecreateReason::OUT_OF_DATE,
            Err(e) => return Err(e),
        }
        // Caps pipelining at one outstanding frame; kept for simplicity.
        backend.wait_idle()?;

        let recreated = !self.pending.is_empty();
        if recreated {
            self.recreate(backend, RecreateReason::empty())?;
        }
        self.enter(LoopState::AcquireImage);
        Ok(TickOutcome::Presented {
            image,
            slot,
            recreated,
        })
    }

    fn recreate<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        reason: RecreateReason,
    ) -> Result<(), VkError> {
        self.enter(LoopState::RecreateSwapchain);
        let reason = reason | std::mem::take(&mut self.pending);
        info!("recreating swapchain ({reason:?})");
        backend.recreate(reason)?;
        self.ring = SlotRing::new(backend.flight_slot_count());
        self.enter(LoopState::AcquireImage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Fence {
        Signaled,
        Reset,
        Pending,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Acquire(usize, u32),
        Wait(u32),
        BeginPass(u32),
        Scene(u32),
        Overlay(u32),
        EndPass(u32),
        Submit(u32, usize),
        Present(u32, usize),
        Idle,
        Recreate(RecreateReason),
    }

    /// Scripted stand-in for the GPU. Images are handed out round-robin unless
    /// a scripted result is queued.
    struct MockBackend {
        slots: usize,
        fences: Vec<Fence>,
        next_image: u32,
        acquire_script: VecDeque<Result<u32, VkError>>,
        present_script: VecDeque<Result<(), VkError>>,
        events: Vec<Event>,
        generation: u32,
        open_pass: Option<u32>,
        scene_drawn: bool,
    }

    impl MockBackend {
        fn new(images: usize, slots: usize) -> Self {
            Self {
                slots,
                fences: vec![Fence::Signaled; images],
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                events: Vec::new(),
                generation: 0,
                open_pass: None,
                scene_drawn: false,
            }
        }

        fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.events.iter().filter(|e| pred(e)).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn flight_slot_count(&self) -> usize {
            self.slots
        }

        fn acquire(&mut self, slot: usize) -> Result<u32, VkError> {
            let image = match self.acquire_script.pop_front() {
                Some(r) => r?,
                None => {
                    let i = self.next_image;
                    self.next_image = (i + 1) % self.fences.len() as u32;
                    i
                }
            };
            self.events.push(Event::Acquire(slot, image));
            Ok(image)
        }

        fn wait_frame(&mut self, image: u32) -> Result<(), VkError> {
            let fence = &mut self.fences[image as usize];
            // A pending fence with nothing left to complete it would block forever.
            assert_eq!(*fence, Fence::Signaled, "deadlock waiting on image {image}");
            *fence = Fence::Reset;
            self.events.push(Event::Wait(image));
            Ok(())
        }

        fn begin_pass(&mut self, image: u32, _scene: &FrameScene) -> Result<(), VkError> {
            assert_eq!(self.fences[image as usize], Fence::Reset, "recorded without reset");
            assert_eq!(self.open_pass.replace(image), None, "pass already open");
            self.scene_drawn = false;
            self.events.push(Event::BeginPass(image));
            Ok(())
        }

        fn record_scene(&mut self, image: u32, _scene: &FrameScene) -> Result<(), VkError> {
            assert_eq!(self.open_pass, Some(image), "scene outside the pass");
            self.scene_drawn = true;
            self.events.push(Event::Scene(image));
            Ok(())
        }

        fn record_overlay(&mut self, image: u32) -> Result<(), VkError> {
            assert_eq!(self.open_pass, Some(image), "overlay outside the pass");
            assert!(self.scene_drawn, "overlay before the scene");
            self.events.push(Event::Overlay(image));
            Ok(())
        }

        fn end_pass(&mut self, image: u32) -> Result<(), VkError> {
            assert_eq!(self.open_pass.take(), Some(image));
            self.events.push(Event::EndPass(image));
            Ok(())
        }

        fn submit(&mut self, image: u32, slot: usize) -> Result<(), VkError> {
            assert_eq!(self.fences[image as usize], Fence::Reset);
            assert_eq!(self.open_pass, None, "submitted with the pass open");
            self.fences[image as usize] = Fence::Pending;
            self.events.push(Event::Submit(image, slot));
            Ok(())
        }

        fn present(&mut self, image: u32, slot: usize) -> Result<(), VkError> {
            self.events.push(Event::Present(image, slot));
            self.present_script.pop_front().unwrap_or(Ok(()))
        }

        fn recreate(&mut self, reason: RecreateReason) -> Result<(), VkError> {
            assert!(
                self.fences.iter().all(|f| *f != Fence::Pending),
                "recreated while work is in flight"
            );
            let images = self.fences.len();
            self.fences = vec![Fence::Signaled; images];
            self.next_image = 0;
            self.generation += 1;
            self.events.push(Event::Recreate(reason));
            Ok(())
        }

        fn wait_idle(&mut self) -> Result<(), VkError> {
            for f in &mut self.fences {
                if *f == Fence::Pending {
                    *f = Fence::Signaled;
                }
            }
            self.events.push(Event::Idle);
            Ok(())
        }
    }

    #[test]
    fn three_ticks_on_two_images_cycle_cleanly() {
        let mut gpu = MockBackend::new(2, 2);
        let mut rl = RenderLoop::new(2);
        let scene = FrameScene::default();
        let mut images = Vec::new();
        for _ in 0..3 {
            match rl.tick(&mut gpu, &scene).unwrap() {
                TickOutcome::Presented { image, recreated, .. } => {
                    assert!(!recreated);
                    images.push(image);
                }
                TickOutcome::Skipped => panic!("unexpected skip"),
            }
        }
        assert_eq!(images, vec![0, 1, 0]);
        assert_eq!(gpu.count(|e| matches!(e, Event::Submit(..))), 3);
        assert_eq!(gpu.count(|e| matches!(e, Event::Present(..))), 3);
        assert_eq!(gpu.count(|e| matches!(e, Event::Idle)), 3);
        assert_eq!(rl.state(), LoopState::AcquireImage);
    }

    #[test]
    fn fence_is_waited_and_reset_before_every_record() {
        let mut gpu = MockBackend::new(3, 2);
        let mut rl = RenderLoop::new(2);
        for _ in 0..7 {
            rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        }
        let mut last_wait = None;
        for e in &gpu.events {
            match e {
                Event::Wait(i) => last_wait = Some(*i),
                Event::BeginPass(i) => assert_eq!(last_wait.take(), Some(*i)),
                _ => {}
            }
        }
    }

    #[test]
    fn overlay_records_after_the_scene_inside_the_pass() {
        let mut gpu = MockBackend::new(2, 2);
        let mut rl = RenderLoop::new(2);
        for _ in 0..3 {
            rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        }
        let recorded: Vec<&Event> = gpu
            .events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::BeginPass(_) | Event::Scene(_) | Event::Overlay(_) | Event::EndPass(_)
                )
            })
            .collect();
        assert_eq!(recorded.len(), 12);
        for (chunk, image) in recorded.chunks(4).zip([0, 1, 0]) {
            assert_eq!(
                chunk,
                [
                    &Event::BeginPass(image),
                    &Event::Scene(image),
                    &Event::Overlay(image),
                    &Event::EndPass(image),
                ]
            );
        }
    }

    #[test]
    fn flight_slot_cycles_with_period_s() {
        for s in 1..=4 {
            let mut gpu = MockBackend::new(3, s);
            let mut rl = RenderLoop::new(s);
            let slots: Vec<usize> = (0..2 * s)
                .map(|_| match rl.tick(&mut gpu, &FrameScene::default()).unwrap() {
                    TickOutcome::Presented { slot, .. } => slot,
                    TickOutcome::Skipped => unreachable!(),
                })
                .collect();
            let expected: Vec<usize> = (0..2 * s).map(|i| i % s).collect();
            assert_eq!(slots, expected, "S = {s}");
        }
    }

    #[test]
    fn stale_acquire_recreates_and_skips_the_frame() {
        let mut gpu = MockBackend::new(2, 2);
        let mut rl = RenderLoop::new(2);
        rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        gpu.acquire_script.push_back(Err(VkError::SurfaceStale));

        let out = rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        assert_eq!(out, TickOutcome::Skipped);
        assert_eq!(gpu.generation, 1);
        assert_eq!(gpu.count(|e| matches!(e, Event::Submit(..))), 1);
        assert_eq!(rl.current_slot(), 0);

        match rl.tick(&mut gpu, &FrameScene::default()).unwrap() {
            TickOutcome::Presented { image, slot, .. } => assert_eq!((image, slot), (0, 0)),
            TickOutcome::Skipped => panic!("should render after rebuild"),
        }
    }

    #[test]
    fn stale_present_recreates_after_presenting() {
        let mut gpu = MockBackend::new(2, 2);
        let mut rl = RenderLoop::new(2);
        gpu.present_script.push_back(Err(VkError::SurfaceStale));
        let out = rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        assert!(matches!(out, TickOutcome::Presented { recreated: true, .. }));
        let tail: Vec<&Event> = gpu.events.iter().rev().take(3).collect();
        assert_eq!(tail[0], &Event::Recreate(RecreateReason::OUT_OF_DATE));
        assert_eq!(tail[1], &Event::Idle);
        assert!(matches!(tail[2], Event::Present(0, 0)));
    }

    #[test]
    fn resize_request_rebuilds_frames_after_one_tick() {
        let mut gpu = MockBackend::new(2, 2);
        let mut rl = RenderLoop::new(2);
        rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        rl.request_recreate(RecreateReason::RESIZED);
        assert_eq!(rl.pending(), RecreateReason::RESIZED);

        let out = rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        assert!(matches!(out, TickOutcome::Presented { recreated: true, .. }));
        assert_eq!(gpu.generation, 1);
        assert!(rl.pending().is_empty());
        assert_eq!(gpu.events.last(), Some(&Event::Recreate(RecreateReason::RESIZED)));
        assert!(gpu.fences.iter().all(|f| *f == Fence::Signaled));
    }

    #[test]
    fn pending_reasons_merge_into_one_rebuild() {
        let mut gpu = MockBackend::new(2, 2);
        let mut rl = RenderLoop::new(2);
        rl.request_recreate(RecreateReason::SHADERS);
        gpu.acquire_script.push_back(Err(VkError::SurfaceStale));
        rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        assert_eq!(
            gpu.events,
            vec![Event::Recreate(RecreateReason::OUT_OF_DATE | RecreateReason::SHADERS)]
        );
    }

    #[test]
    fn fatal_errors_propagate() {
        let mut gpu = MockBackend::new(2, 2);
        let mut rl = RenderLoop::new(2);
        gpu.acquire_script.push_back(Err(VkError::Command {
            call: "vkAcquireNextImageKHR",
            result: vk::Result::ERROR_DEVICE_LOST,
        }));
        let err = rl.tick(&mut gpu, &FrameScene::default()).unwrap_err();
        assert!(!err.is_stale());
        assert_eq!(gpu.generation, 0);
    }

    #[test]
    fn ring_resizes_to_backend_slot_count_after_rebuild() {
        let mut gpu = MockBackend::new(2, 3);
        let mut rl = RenderLoop::new(1);
        rl.request_recreate(RecreateReason::RESTORED);
        rl.tick(&mut gpu, &FrameScene::default()).unwrap();
        let slots: Vec<usize> = (0..3)
            .map(|_| match rl.tick(&mut gpu, &FrameScene::default()).unwrap() {
                TickOutcome::Presented { slot, .. } => slot,
                TickOutcome::Skipped => unreachable!(),
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2]);
    }
}
