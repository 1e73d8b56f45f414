use std::time::Duration;

pub const GREETING: &str = "о привет";
pub const UNKNOWN_TAG: &str = "Нет такого тага";
pub const START: &str = "I'm a bot, please talk to me!";

pub fn autopic_status(period: Option<Duration>) -> String {
    match period {
        Some(period) => format!("Картинки каждые {} мин.", period.as_secs() / 60),
        None => String::from("Картинки выключены."),
    }
}

pub fn autopic_usage() -> String {
    String::from("Используй /autopic <минуты> или /autopic off")
}

pub fn autopic_unknown_chat() -> String {
    String::from("Картинки по таймеру работают только в группах.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_in_minutes() {
        assert_eq!(autopic_status(Some(Duration::from_secs(3600))), "Картинки каждые 60 мин.");
        assert_eq!(autopic_status(None), "Картинки выключены.");
    }
}
