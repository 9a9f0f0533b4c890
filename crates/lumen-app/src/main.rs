// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use lumen_core::{init_tracing, FrameClock};
use lumen_platform::SurfaceSignal;
use lumen_render::{RenderSize, Renderer, Simulation};
use lumen_render_vk::{FramePulse, VkRenderer};
use tracing::{error, info};

use lumen_platform::winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

mod config;
mod demo;

use config::{AppCfg, PresentMode};
use demo::DemoSim;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config
    #[arg(long, default_value = "lumen.toml")]
    config: PathBuf,
    /// Override [render] present_mode
    #[arg(long, value_enum)]
    present_mode: Option<PresentMode>,
    /// Override [render] flight_slots
    #[arg(long)]
    flight_slots: Option<usize>,
    /// Flash a corner square every frame to spot stalls
    #[arg(long)]
    frame_pulse: bool,
}

struct App {
    cfg: AppCfg,
    // Declared before `window`: the surface must go before the window it wraps.
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    sim: Box<dyn Simulation>,
    frame_pulse: bool,
    render_size: RenderSize,
    clock: FrameClock,
    paused: bool,
    occluded: bool,
    exiting: bool,
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: AppCfg, sim: Box<dyn Simulation>, frame_pulse: bool) -> Self {
        Self {
            cfg,
            renderer: None,
            window: None,
            sim,
            frame_pulse,
            render_size: RenderSize {
                width: 1,
                height: 1,
            },
            clock: FrameClock::new(Instant::now()),
            paused: false,
            occluded: false,
            exiting: false,
            fatal: None,
        }
    }

    fn init_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.cfg.window.title.clone())
            .with_inner_size(PhysicalSize::new(self.cfg.window.width, self.cfg.window.height));
        let window = event_loop.create_window(attrs)?;
        let size = window.inner_size();
        self.render_size = RenderSize {
            width: size.width,
            height: size.height,
        };

        let settings = self.cfg.render_settings();
        let mut renderer = VkRenderer::new(&window, &window, self.render_size, &settings)?;
        if self.frame_pulse {
            renderer.set_overlay(Some(Box::new(FramePulse::default())));
        }
        self.sim.load(&mut renderer)?;
        self.sim.start(self.render_size);
        self.clock.reset(Instant::now());

        self.paused = self.render_size.is_zero_area();
        info!(
            "window {}x{} present={:?} slots={} (paused={})",
            self.render_size.width,
            self.render_size.height,
            settings.present,
            settings.flight_slots,
            self.paused
        );
        window.request_redraw();
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    /// Tears the renderer down first, then leaves the event loop; `main` returns the error.
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("fatal: {err:#}");
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        self.fatal = Some(err);
        event_loop.exit();
    }

    fn update_paused(&mut self) {
        let now_paused = self.occluded || self.render_size.is_zero_area();
        if now_paused != self.paused {
            info!("paused={now_paused}");
            self.paused = now_paused;
            self.clock.reset(Instant::now());
        }
    }

    fn on_surface(&mut self, event_loop: &ActiveEventLoop, signal: SurfaceSignal) {
        match signal {
            SurfaceSignal::CloseRequested => {
                info!("CloseRequested");
                self.exiting = true;
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }
            SurfaceSignal::Resized { width, height } => {
                self.render_size = RenderSize { width, height };
                self.update_paused();
                self.push_size(event_loop);
            }
            SurfaceSignal::Occluded(occluded) => {
                self.occluded = occluded;
                self.update_paused();
                if !occluded {
                    // Restored windows may come back with a different surface.
                    self.push_size(event_loop);
                }
            }
        }
    }

    fn push_size(&mut self, event_loop: &ActiveEventLoop) {
        let Some(r) = self.renderer.as_mut() else {
            return;
        };
        if let Err(e) = r.resize(self.render_size) {
            self.fail(event_loop, e);
            return;
        }
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting || self.paused {
            return;
        }
        let Some(r) = self.renderer.as_mut() else {
            return;
        };
        let now = Instant::now();
        let dt = self.clock.tick(now);
        let scene = self.sim.update(dt, self.render_size);
        if let Err(e) = r.render(&scene) {
            self.fail(event_loop, e);
            return;
        }
        self.clock.count_frame();
        if let Some(fps) = self.clock.take_fps(now) {
            info!("fps ~ {fps}");
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() && !self.exiting {
            if let Err(e) = self.init_window(event_loop) {
                self.fail(event_loop, e);
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        if let Some(signal) = SurfaceSignal::from_window_event(&event) {
            self.on_surface(event_loop, signal);
            return;
        }

        match event {
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::F5),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => {
                if let Some(r) = self.renderer.as_mut() {
                    info!("shader reload requested");
                    r.request_shader_reload();
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        event_loop.set_control_flow(ControlFlow::Wait);
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = config::load(&args.config);
    cfg.apply_overrides(args.present_mode, args.flight_slots);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, Box::new(DemoSim::default()), args.frame_pulse);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
