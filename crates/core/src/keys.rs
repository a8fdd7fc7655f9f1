use chrono::{DateTime, Utc};

/// 存储键命名，所有键可带统一的命名空间前缀
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(namespace: Option<&str>) -> Self {
        let prefix = match namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}:"),
            _ => String::new(),
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, raw: &str) -> String {
        format!("{}{}", self.prefix, raw)
    }

    /// 去掉命名空间前缀
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }

    pub fn queue(&self, name: &str) -> String {
        self.key(&format!("queue:{name}"))
    }

    pub fn queues(&self) -> String {
        self.key("queues")
    }

    pub fn schedule(&self) -> String {
        self.key("schedule")
    }

    pub fn retry(&self) -> String {
        self.key("retry")
    }

    pub fn dead(&self) -> String {
        self.key("dead")
    }

    pub fn processes(&self) -> String {
        self.key("processes")
    }

    pub fn process(&self, identity: &str) -> String {
        self.key(identity)
    }

    pub fn work(&self, identity: &str) -> String {
        self.key(&format!("{identity}:work"))
    }

    pub fn signals(&self, identity: &str) -> String {
        self.key(&format!("{identity}-signals"))
    }

    /// 进程在某个队列上的暂存列表
    pub fn staging(&self, identity: &str, queue: &str) -> String {
        self.key(&format!("inflight:{identity}:{queue}"))
    }

    pub fn staging_pattern(&self) -> String {
        self.key("inflight:*")
    }

    /// 从暂存键解析出 (进程标识, 队列名)；队列名不含冒号
    pub fn parse_staging(&self, key: &str) -> Option<(String, String)> {
        let rest = self.strip(key)?.strip_prefix("inflight:")?;
        let (identity, queue) = rest.rsplit_once(':')?;
        if identity.is_empty() || queue.is_empty() {
            return None;
        }
        Some((identity.to_string(), queue.to_string()))
    }

    pub fn stat(&self, name: &str) -> String {
        self.key(&format!("stat:{name}"))
    }

    pub fn stat_daily(&self, name: &str, at: DateTime<Utc>) -> String {
        self.key(&format!("stat:{name}:{}", at.format("%Y-%m-%d")))
    }
}
