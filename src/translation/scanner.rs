use super::parsers::is_ident_char;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum QuoteState {
    #[default]
    Unquoted,
    Quoted {
        delim: char,
        escaped: bool,
    },
}

/// `$$` literal tracking. `Opening` and `Closing` have seen one `$`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum DollarState {
    #[default]
    Outside,
    Opening,
    Inside,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum ParamState {
    #[default]
    Idle,
    /// A `:` was held back.
    AwaitingStart,
    InName,
}

/// What the driver does with the character just fed to [`ScanState::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Action {
    /// Append the character.
    Copy,
    /// Hold the `:` back until the next character decides.
    Hold,
    /// Append the held `:` and the character (`::`, `:=`).
    Cast,
    /// The character extends the parameter name.
    Name,
    /// Replace the finished name, then step the character again.
    EndName,
    /// Append the held `:`, then step the character again.
    Release,
    /// Flush the statement; the character is dropped.
    Separator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) struct ScanState {
    pub(super) quote: QuoteState,
    pub(super) dollar: DollarState,
    pub(super) param: ParamState,
}

impl ScanState {
    pub(super) fn step(&mut self, c: char) -> Action {
        match self.param {
            ParamState::InName => {
                if is_ident_char(c) {
                    return Action::Name;
                }
                self.param = ParamState::Idle;
                return Action::EndName;
            }
            ParamState::AwaitingStart => {
                if is_ident_char(c) {
                    self.param = ParamState::InName;
                    return Action::Name;
                }
                self.param = ParamState::Idle;
                return if c == ':' || c == '=' {
                    Action::Cast
                } else {
                    Action::Release
                };
            }
            ParamState::Idle => {}
        }

        if let QuoteState::Quoted { delim, escaped } = self.quote {
            self.quote = if escaped {
                QuoteState::Quoted {
                    delim,
                    escaped: false,
                }
            } else if c == '\\' {
                QuoteState::Quoted {
                    delim,
                    escaped: true,
                }
            } else if c == delim {
                QuoteState::Unquoted
            } else {
                self.quote
            };
            return Action::Copy;
        }

        match self.dollar {
            DollarState::Inside => {
                if c == '$' {
                    self.dollar = DollarState::Closing;
                }
                return Action::Copy;
            }
            DollarState::Closing => {
                self.dollar = if c == '$' {
                    DollarState::Outside
                } else {
                    DollarState::Inside
                };
                return Action::Copy;
            }
            DollarState::Opening => {
                if c == '$' {
                    self.dollar = DollarState::Inside;
                    return Action::Copy;
                }
                // lone `$`, e.g. an existing `$1`
                self.dollar = DollarState::Outside;
            }
            DollarState::Outside => {}
        }

        match c {
            '\'' | '"' => {
                self.quote = QuoteState::Quoted {
                    delim: c,
                    escaped: false,
                };
                Action::Copy
            }
            '$' => {
                self.dollar = DollarState::Opening;
                Action::Copy
            }
            ':' => {
                self.param = ParamState::AwaitingStart;
                Action::Hold
            }
            ';' => Action::Separator,
            _ => Action::Copy,
        }
    }
}
