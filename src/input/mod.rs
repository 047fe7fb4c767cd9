/// Input producers. They only talk to the engine through a `SessionHandle`.
pub mod text;
pub mod voice;
