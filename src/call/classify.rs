use rsip::Response;

/// What a response means to the call, independent of the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Provisional(u16),
    Success(u16),
    /// 401 or 407: resend with credentials.
    Challenge(u16),
    Failure(u16),
}

pub fn classify_code(code: u16) -> ResponseClass {
    match code {
        100..=199 => ResponseClass::Provisional(code),
        200..=299 => ResponseClass::Success(code),
        401 | 407 => ResponseClass::Challenge(code),
        _ => ResponseClass::Failure(code),
    }
}

pub fn classify(response: &Response) -> ResponseClass {
    classify_code(response.status_code.code())
}
