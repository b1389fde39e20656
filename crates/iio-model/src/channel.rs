//! Channels, their type and modifier tables.
//!
//! The numeric value of [`ChannelType`] and [`Modifier`] is what the kernel
//! packs into event identifiers, so both tables are fixed and explicit.

use std::fmt;

use crate::attr::AttrList;
use crate::format::DataFormat;

macro_rules! fixed_table {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $value:literal => $text:literal,)* }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum $name {
            $($variant,)*
        }

        impl $name {
            /// Every entry in wire order.
            pub const ALL: &'static [$name] = &[$($name::$variant,)*];

            /// Wire value of this entry.
            pub fn raw(self) -> u32 {
                match self {
                    $($name::$variant => $value,)*
                }
            }

            /// Looks an entry up by wire value.
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $($value => Some($name::$variant),)*
                    _ => None,
                }
            }

            /// Name used in sysfs channel identifiers.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

fixed_table! {
    /// Physical quantity measured or produced by a channel.
    ChannelType {
        Voltage = 0 => "voltage",
        Current = 1 => "current",
        Power = 2 => "power",
        Accel = 3 => "accel",
        AnglVel = 4 => "anglvel",
        Magn = 5 => "magn",
        Light = 6 => "illuminance",
        Intensity = 7 => "intensity",
        Proximity = 8 => "proximity",
        Temp = 9 => "temp",
        Incli = 10 => "incli",
        Rot = 11 => "rot",
        Angl = 12 => "angl",
        Timestamp = 13 => "timestamp",
        Capacitance = 14 => "capacitance",
        AltVoltage = 15 => "altvoltage",
        Cct = 16 => "cct",
        Pressure = 17 => "pressure",
        HumidityRelative = 18 => "humidityrelative",
        Activity = 19 => "activity",
        Steps = 20 => "steps",
        Energy = 21 => "energy",
        Distance = 22 => "distance",
        Velocity = 23 => "velocity",
        Concentration = 24 => "concentration",
        Resistance = 25 => "resistance",
        Ph = 26 => "ph",
        UvIndex = 27 => "uvindex",
        ElectricalConductivity = 28 => "electricalconductivity",
        Count = 29 => "count",
        Index = 30 => "index",
        Gravity = 31 => "gravity",
        PositionRelative = 32 => "positionrelative",
        Phase = 33 => "phase",
        MassConcentration = 34 => "massconcentration",
        DeltaAngl = 35 => "delta_angl",
        DeltaVelocity = 36 => "delta_velocity",
        ColorTemp = 37 => "colortemp",
        Chromaticity = 38 => "chromaticity",
        Attention = 39 => "attention",
    }
}

fixed_table! {
    /// Qualifier refining a channel's type (axis, color, gas...).
    Modifier {
        None = 0 => "",
        X = 1 => "x",
        Y = 2 => "y",
        Z = 3 => "z",
        XAndY = 4 => "x&y",
        XAndZ = 5 => "x&z",
        YAndZ = 6 => "y&z",
        XAndYAndZ = 7 => "x&y&z",
        XOrY = 8 => "x|y",
        XOrZ = 9 => "x|z",
        YOrZ = 10 => "y|z",
        XOrYOrZ = 11 => "x|y|z",
        LightBoth = 12 => "both",
        LightIr = 13 => "ir",
        RootSumSquaredXY = 14 => "sqrt(x^2+y^2)",
        SumSquaredXYZ = 15 => "x^2+y^2+z^2",
        LightClear = 16 => "clear",
        LightRed = 17 => "red",
        LightGreen = 18 => "green",
        LightBlue = 19 => "blue",
        Quaternion = 20 => "quaternion",
        TempAmbient = 21 => "ambient",
        TempObject = 22 => "object",
        NorthMagn = 23 => "from_north_magnetic",
        NorthTrue = 24 => "from_north_true",
        NorthMagnTiltComp = 25 => "from_north_magnetic_tilt_comp",
        NorthTrueTiltComp = 26 => "from_north_true_tilt_comp",
        Running = 27 => "running",
        Jogging = 28 => "jogging",
        Walking = 29 => "walking",
        Still = 30 => "still",
        RootSumSquaredXYZ = 31 => "sqrt(x^2+y^2+z^2)",
        I = 32 => "i",
        Q = 33 => "q",
        Co2 = 34 => "co2",
        Voc = 35 => "voc",
        LightUv = 36 => "uv",
        LightDuv = 37 => "duv",
        Pm1 = 38 => "pm1",
        Pm2p5 = 39 => "pm2p5",
        Pm4 = 40 => "pm4",
        Pm10 = 41 => "pm10",
        Ethanol = 42 => "ethanol",
        H2 = 43 => "h2",
        O2 = 44 => "o2",
        LinearX = 45 => "linear_x",
        LinearY = 46 => "linear_y",
        LinearZ = 47 => "linear_z",
        Pitch = 48 => "pitch",
        Yaw = 49 => "yaw",
        Roll = 50 => "roll",
        LightUva = 51 => "uva",
        LightUvb = 52 => "uvb",
    }
}

impl ChannelType {
    /// Detects the type from a channel id: the first table entry that is a
    /// prefix of `id` followed by end of string, `_` or a digit.
    pub fn detect(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| {
            id.strip_prefix(t.name())
                .map(|rest| match rest.as_bytes().first() {
                    None => true,
                    Some(c) => *c == b'_' || c.is_ascii_digit(),
                })
                .unwrap_or(false)
        })
    }
}

impl Modifier {
    /// Detects the modifier from the text after the first `_` of `id`.
    pub fn detect(id: &str) -> Self {
        let Some((_, tail)) = id.split_once('_') else {
            return Modifier::None;
        };
        Self::ALL
            .iter()
            .copied()
            .skip(1)
            .find(|m| tail.starts_with(m.name()))
            .unwrap_or(Modifier::None)
    }
}

/// Data flow direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Device to host.
    #[default]
    Input,
    /// Host to device.
    Output,
}

impl Direction {
    /// XML spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// One channel of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Identifier such as `voltage0` or `accel_x`.
    pub id: String,
    /// Optional extended name.
    pub name: Option<String>,
    /// Optional label.
    pub label: Option<String>,
    /// Input or output.
    pub direction: Direction,
    /// Detected type, `None` when unknown.
    pub chan_type: Option<ChannelType>,
    /// Detected modifier.
    pub modifier: Modifier,
    /// Scan index; negative for channels that are not scan elements.
    pub index: i64,
    /// Sample format, meaningful for scan elements only.
    pub format: DataFormat,
    /// True when the channel carries samples in buffers.
    pub is_scan_element: bool,
    /// Position in the device's sorted channel list.
    pub number: usize,
    /// Channel attributes, sorted by name.
    pub attrs: AttrList,
}

impl Channel {
    /// Creates a channel and runs type/modifier detection on its id.
    pub fn new(id: impl Into<String>, direction: Direction) -> Self {
        let id = id.into();
        let chan_type = ChannelType::detect(&id);
        let modifier = Modifier::detect(&id);
        Self {
            id,
            name: None,
            label: None,
            direction,
            chan_type,
            modifier,
            index: -1,
            format: DataFormat::default(),
            is_scan_element: false,
            number: 0,
            attrs: AttrList::default(),
        }
    }

    /// Turns the channel into a scan element at `index` with `format`.
    pub fn with_scan_element(mut self, index: i64, format: DataFormat) -> Self {
        self.index = index;
        self.format = format;
        self.is_scan_element = true;
        self
    }

    /// True for output channels.
    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }

    /// Wire value of the channel type, `i32::MAX` when unknown.
    pub fn type_raw(&self) -> u32 {
        self.chan_type.map(ChannelType::raw).unwrap_or(i32::MAX as u32)
    }

    /// Converts one raw sample of this channel to a host integer.
    pub fn convert(&self, raw: &[u8]) -> crate::error::Result<i64> {
        self.format.decode(raw)
    }

    /// Converts a host integer into this channel's storage layout.
    pub fn convert_inverse(&self, value: i64, out: &mut [u8]) -> crate::error::Result<()> {
        self.format.encode(value, out)
    }

    /// Number following the alphabetic prefix of the id, parsed like
    /// `strtoul` (0 when no digits follow).
    pub(crate) fn id_number(&self) -> u64 {
        self.id
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .fold(0u64, |acc, c| {
                acc.saturating_mul(10)
                    .saturating_add(u64::from(c as u8 - b'0'))
            })
    }

    /// True when the id is purely alphabetic.
    pub(crate) fn id_is_alphabetic(&self) -> bool {
        self.id.chars().all(|c| c.is_ascii_alphabetic())
    }
}
