//! 服务端原子脚本

/// 迁移到期的定时/重试任务
///
/// KEYS: [有序集合, 队列名集合, 死信集合]
/// ARGV: [now, limit, 队列键前缀]
///
/// 只有 ZREM 成功的成员才会入队，多个轮询进程并发执行时不会重复入队。
/// 无法解析的负载直接进入死信集合。
pub const PROMOTE_DUE: &str = r#"
local jobs = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local moved = 0
for _, job in ipairs(jobs) do
  if redis.call('ZREM', KEYS[1], job) == 1 then
    local ok, decoded = pcall(cjson.decode, job)
    if ok and type(decoded) == 'table' then
      local queue = decoded['queue']
      if type(queue) ~= 'string' or queue == '' then
        queue = 'default'
      end
      redis.call('SADD', KEYS[2], queue)
      redis.call('LPUSH', ARGV[3] .. queue, job)
      moved = moved + 1
    else
      redis.call('ZADD', KEYS[3], ARGV[1], job)
    end
  end
end
return moved
"#;

/// 暂存列表 -> 队列右端
///
/// KEYS: [暂存列表, 队列]
/// ARGV: [负载]
pub const REQUEUE: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
  redis.call('RPUSH', KEYS[2], ARGV[1])
  return 1
end
return 0
"#;

/// 暂存列表 -> 重试集合
///
/// KEYS: [暂存列表, 重试集合]
/// ARGV: [暂存的负载, 更新后的负载, 执行时间]
pub const RETRY: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
  return 1
end
return 0
"#;

/// 暂存列表 -> 死信集合，写入后先按时间再按数量淘汰
///
/// KEYS: [暂存列表, 死信集合]
/// ARGV: [暂存的负载, 更新后的负载, now, 淘汰时间点, 最大数量]
pub const KILL: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
  redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', '(' .. ARGV[4])
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, -(tonumber(ARGV[5]) + 1))
  return 1
end
return 0
"#;

/// 有序集合 -> 队列左端
///
/// KEYS: [有序集合, 队列名集合, 队列]
/// ARGV: [负载, 队列名]
pub const MOVE_TO_QUEUE: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('SADD', KEYS[2], ARGV[2])
  redis.call('LPUSH', KEYS[3], ARGV[1])
  return 1
end
return 0
"#;
