pub mod background;
pub mod canvas;
pub mod clip_writer;
pub mod contour_localizer;
pub mod features;
pub mod frame;
pub mod localizer;
pub mod motion_gate;
pub mod network_localizer;
pub mod optical_flow;
pub mod recorder;
pub mod source;
pub mod tracker;
