//! Port type tags shared between the data model and the engine.

/// The kind of data a port carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortType {
    /// Audio-rate signal, one float per frame.
    Audio,
    /// A single control value per cycle.
    Control,
    /// Control-rate signal sampled at audio rate (one float per frame).
    Cv,
    /// A sequence of timestamped atom events.
    Atom,
}

impl PortType {
    /// True for types whose buffers are float signals (AUDIO and CV).
    pub fn is_signal(self) -> bool {
        matches!(self, PortType::Audio | PortType::Cv)
    }

    /// True for types a control value can be written to.
    pub fn is_control(self) -> bool {
        matches!(self, PortType::Control | PortType::Cv)
    }

    /// Whether an arc from `self` to `dst` is type-correct. Signal types are
    /// interchangeable with each other and with CONTROL (broadcast/sample);
    /// ATOM only connects to ATOM.
    pub fn can_connect(self, dst: PortType) -> bool {
        match (self, dst) {
            (PortType::Atom, PortType::Atom) => true,
            (PortType::Atom, _) | (_, PortType::Atom) => false,
            _ => true,
        }
    }
}

/// Whether a port consumes or produces data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn is_input(self) -> bool {
        self == Direction::Input
    }
    pub fn is_output(self) -> bool {
        self == Direction::Output
    }
}
